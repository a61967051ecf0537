use super::*;

fn raw_with_required() -> RawSettings {
    let mut raw = RawSettings::default();
    raw.origin.bucket = Some("media".to_string());
    raw.signing.key = Some("s3cr3t".to_string());
    raw
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(raw_with_required()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.directory, PathBuf::from("./data/cache"));
    assert!(settings.cache.coalesce_image_misses);

    match settings.origin {
        OriginSettings::S3(s3) => {
            assert_eq!(s3.bucket, "media");
            assert_eq!(s3.region, "localhost");
            assert_eq!(s3.endpoint, None);
            assert!(!s3.force_path_style);
            assert!(!s3.allow_http);
        }
        OriginSettings::Local { .. } => panic!("s3 is the default backend"),
    }
    assert_eq!(settings.signing.key.expose(), "s3cr3t");
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = raw_with_required();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.coalesce_image_misses = Some(true);

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_coalesce_image_misses: Some(false),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.cache.coalesce_image_misses);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = raw_with_required();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn signing_key_is_required() {
    let mut raw = raw_with_required();
    raw.signing.key = Some(String::new());

    let err = Settings::from_raw(raw).expect_err("empty key rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "signing.key",
            ..
        }
    ));
}

#[test]
fn s3_backend_requires_bucket() {
    let mut raw = raw_with_required();
    raw.origin.bucket = Some("   ".to_string());

    let err = Settings::from_raw(raw).expect_err("bucket required");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "origin.bucket",
            ..
        }
    ));
}

#[test]
fn none_marker_clears_endpoint() {
    for endpoint in ["", "[none]"] {
        let mut raw = raw_with_required();
        raw.origin.endpoint = Some(endpoint.to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        match settings.origin {
            OriginSettings::S3(s3) => assert_eq!(s3.endpoint, None, "endpoint `{endpoint}`"),
            OriginSettings::Local { .. } => panic!("expected s3"),
        }
    }

    let mut raw = raw_with_required();
    raw.apply_origin_overrides(&OriginOverrides {
        origin_endpoint: Some("http://minio:9000".to_string()),
        origin_force_path_style: Some(true),
        origin_allow_http: Some(true),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    match settings.origin {
        OriginSettings::S3(s3) => {
            assert_eq!(s3.endpoint.as_deref(), Some("http://minio:9000"));
            assert!(s3.force_path_style);
            assert!(s3.allow_http);
        }
        OriginSettings::Local { .. } => panic!("expected s3"),
    }
}

#[test]
fn local_backend_needs_directory_only() {
    let mut raw = RawSettings::default();
    raw.signing.key = Some("k".to_string());
    raw.origin.backend = Some("local".to_string());

    let err = Settings::from_raw(raw.clone()).expect_err("directory required");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "origin.local_directory",
            ..
        }
    ));

    raw.origin.local_directory = Some(PathBuf::from("/srv/objects"));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(
        settings.origin,
        OriginSettings::Local { ref directory } if directory == std::path::Path::new("/srv/objects")
    ));
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = raw_with_required();
    raw.origin.backend = Some("gcs".to_string());

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "origin.backend",
            ..
        })
    ));
}

#[test]
fn secrets_are_redacted_from_debug_output() {
    let mut raw = raw_with_required();
    raw.origin.secret_access_key = Some("aws-secret".to_string());
    let raw_debug = format!("{raw:?}");
    assert!(!raw_debug.contains("aws-secret"));
    assert!(!raw_debug.contains("s3cr3t"));

    let settings = Settings::from_raw(raw).expect("valid settings");
    let debug = format!("{settings:?}");
    assert!(!debug.contains("aws-secret"));
    assert!(!debug.contains("s3cr3t"));
    assert!(debug.contains("[redacted]"));
}

#[test]
fn zero_port_is_rejected() {
    let mut raw = raw_with_required();
    raw.server.port = Some(0);

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "server.port",
            ..
        })
    ));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["imagecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "imagecache",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--origin-backend",
        "local",
        "--origin-local-directory",
        "/srv/objects",
        "--cache-directory",
        "/var/cache/imagecache",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.origin.origin_backend.as_deref(),
                Some("local")
            );
            assert_eq!(
                serve.overrides.cache_directory.as_deref(),
                Some(std::path::Path::new("/var/cache/imagecache"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_sign_arguments() {
    let args = CliArgs::parse_from([
        "imagecache",
        "sign",
        "--kind",
        "file",
        "--options",
        "nc+m:text/plain",
        "--signing-key",
        "k",
        "docs/readme.txt",
    ]);

    match args.command.expect("sign command") {
        Command::Sign(sign) => {
            assert_eq!(sign.kind, SignKind::File);
            assert_eq!(sign.options, "nc+m:text/plain");
            assert_eq!(sign.object_path, "docs/readme.txt");

            let mut raw = RawSettings::default();
            raw.origin.bucket = Some("media".to_string());
            raw.apply_sign_overrides(&sign);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.signing.key.expose(), "k");
        }
        _ => panic!("wrong command parsed"),
    }
}
