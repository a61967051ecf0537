//! Request option parsing.
//!
//! Options travel in a single path segment as `+`-joined `key[:value]`
//! tokens, e.g. `w:320+h:200+contain+webp`. Parsing happens in two steps: the
//! raw segment becomes a [`RawOptions`] map, which is then read into the
//! typed [`FileOptions`] or [`ImageOptions`] for the requested route.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

const TOKEN_SEPARATOR: char = '+';
const VALUE_SEPARATOR: char = ':';
const FLAG_VALUE: &str = "true";

const KEY_NO_CACHE: &str = "nc";
const KEY_MIME_TYPE: &str = "m";
const KEY_WIDTH: &str = "w";
const KEY_HEIGHT: &str = "h";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidValue { key: &'static str, value: String },
}

/// Untyped key/value view of an option segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOptions {
    entries: HashMap<String, String>,
}

impl RawOptions {
    /// Split `raw` into tokens. A token without a value becomes a `true` flag;
    /// later duplicates replace earlier ones.
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split(TOKEN_SEPARATOR)
            .map(|token| match token.split_once(VALUE_SEPARATOR) {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token.to_string(), FLAG_VALUE.to_string()),
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

}

/// Options accepted by the pass-through `/file` route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOptions {
    pub no_cache: bool,
    pub mime_type: Option<String>,
}

impl FileOptions {
    pub fn from_raw(raw: &RawOptions) -> Self {
        Self {
            no_cache: raw.contains(KEY_NO_CACHE),
            mime_type: raw
                .get(KEY_MIME_TYPE)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        }
    }
}

/// Declares a flag-keyed option enum: each variant is selected by the
/// presence of its key in the option segment.
macro_rules! flag_enum {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident, {
            $($variant:ident => $key:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Variants in the order their keys are checked.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $key),+
                }
            }

            fn from_raw(raw: &RawOptions) -> Self {
                Self::ALL
                    .iter()
                    .copied()
                    .filter(|candidate| raw.contains(candidate.as_str()))
                    .last()
                    .unwrap_or($name::$default)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

flag_enum!(
    /// How the image is fitted into the requested box.
    Fit, default = Cover, {
        Cover => "cover",
        Contain => "contain",
        Fill => "fill",
        Inside => "inside",
        Outside => "outside",
    }
);

flag_enum!(
    /// Crop/letterbox anchor requested by the client.
    Position, default = Center, {
        Top => "top",
        RightTop => "right-top",
        Right => "right",
        RightBottom => "right-bottom",
        Bottom => "bottom",
        LeftBottom => "left-bottom",
        Left => "left",
        LeftTop => "left-top",
        Center => "center",
        Entropy => "entropy",
        Attention => "attention",
    }
);

flag_enum!(
    /// Output encoding. `Raw` keeps the source encoding.
    ImageFormat, default = Raw, {
        Jpeg => "jpeg",
        Png => "png",
        Webp => "webp",
        Raw => "raw",
    }
);

impl ImageFormat {
    /// MIME type sent for this format; `None` for `raw`.
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            ImageFormat::Jpeg => Some("image/jpeg"),
            ImageFormat::Png => Some("image/png"),
            ImageFormat::Webp => Some("image/webp"),
            ImageFormat::Raw => None,
        }
    }
}

/// Options accepted by the `/image` route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    pub position: Position,
    pub format: ImageFormat,
}

impl ImageOptions {
    pub fn from_raw(raw: &RawOptions) -> Result<Self, OptionsError> {
        Ok(Self {
            width: read_dimension(raw, KEY_WIDTH)?,
            height: read_dimension(raw, KEY_HEIGHT)?,
            fit: Fit::from_raw(raw),
            position: Position::from_raw(raw),
            format: ImageFormat::from_raw(raw),
        })
    }

    /// Cache labels in fixed order: width, height, fit, format.
    ///
    /// Fit and format share the `f_` prefix; existing cache directories depend
    /// on it, so it must not change.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(4);
        if let Some(width) = self.width {
            labels.push(format!("w_{width}"));
        }
        if let Some(height) = self.height {
            labels.push(format!("h_{height}"));
        }
        labels.push(format!("f_{}", self.fit));
        labels.push(format!("f_{}", self.format));
        labels
    }
}

/// Read a pixel dimension. Zero is treated as "not set".
fn read_dimension(raw: &RawOptions, key: &'static str) -> Result<Option<u32>, OptionsError> {
    let Some(value) = raw.get(key) else {
        return Ok(None);
    };

    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(OptionsError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }

    let parsed: u32 = value.parse().map_err(|_| OptionsError::InvalidValue {
        key,
        value: value.to_string(),
    })?;

    Ok((parsed > 0).then_some(parsed))
}
