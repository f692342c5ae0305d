//! Directive wire types.
//!
//! A directive is one server-issued instruction: a JSON object with a
//! `header` (namespace, name, message ids) and a loosely typed `payload`
//! whose fields depend on the directive kind. One catch-all payload shape is
//! used rather than one struct per kind, matching the wire format where
//! unknown fields are simply absent.
//!
//! Some responses nest the directive one level down under a top-level
//! `"directive"` key; [`Directive::from_json`] tolerates both shapes.

use serde::Deserialize;

/// `playBehavior` value that subsumes everything queued.
const PLAY_BEHAVIOR_REPLACE_ALL: &str = "REPLACE_ALL";

/// `playBehavior` value that drops pending-but-not-started items.
const PLAY_BEHAVIOR_REPLACE_ENQUEUED: &str = "REPLACE_ENQUEUED";

/// One server-issued instruction, paired with its binary audio part when the
/// payload references one by content id.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Directive {
    pub header: Header,

    #[serde(default)]
    pub payload: Payload,

    /// Binary audio attached during multipart parsing when the payload
    /// references a `cid:` URL. Never present on the wire itself.
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
}

/// Routing header common to all directives.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub message_id: String,

    #[serde(default)]
    pub dialog_request_id: String,
}

/// Catch-all directive payload.
///
/// Which fields are populated depends on the directive kind; absent fields
/// deserialize to their defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default, rename = "type")]
    pub alert_type: String,

    #[serde(default)]
    pub scheduled_time: String,

    #[serde(default)]
    pub play_behavior: Option<String>,

    #[serde(default)]
    pub audio_item: Option<AudioItem>,

    #[serde(default)]
    pub volume: i64,

    #[serde(default)]
    pub mute: bool,

    #[serde(default)]
    pub timeout_in_milliseconds: u64,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub code: String,

    #[serde(default)]
    token: String,
}

/// Remote or attached audio content description.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioItem {
    #[serde(default)]
    pub audio_item_id: String,

    #[serde(default)]
    pub stream: Option<Stream>,
}

/// Stream descriptor inside an [`AudioItem`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub stream_format: Option<String>,

    #[serde(default)]
    pub offset_in_milliseconds: u64,

    #[serde(default)]
    pub expiry_time: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub expected_previous_token: Option<String>,
}

/// Top-level wrapper shape some responses use.
#[derive(Debug, Deserialize)]
struct Wrapper {
    directive: Option<Directive>,
}

impl Payload {
    /// The correlation token, falling back to the nested stream token when
    /// the top-level field is blank (audio-player directives carry it there).
    #[must_use]
    pub fn token(&self) -> &str {
        if !self.token.is_empty() {
            return &self.token;
        }

        self.audio_item
            .as_ref()
            .and_then(|item| item.stream.as_ref())
            .and_then(|stream| stream.token.as_deref())
            .unwrap_or_default()
    }
}

impl Directive {
    /// Parses a directive from JSON, tolerating the optional top-level
    /// `"directive"` wrapper key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the body is not valid JSON for either shape.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        if let Ok(Wrapper {
            directive: Some(directive),
        }) = serde_json::from_str::<Wrapper>(body)
        {
            return Ok(directive);
        }

        serde_json::from_str(body)
    }

    /// The `cid:` audio reference in this directive's payload, if any.
    ///
    /// `Speak` carries it in `payload.url`; `Play` nests it in the stream
    /// descriptor.
    #[must_use]
    pub fn audio_reference(&self) -> Option<&str> {
        if self.payload.url.starts_with("cid:") {
            return Some(&self.payload.url);
        }

        self.payload
            .audio_item
            .as_ref()
            .and_then(|item| item.stream.as_ref())
            .map(|stream| stream.url.as_str())
            .filter(|url| url.starts_with("cid:"))
    }

    #[must_use]
    pub fn replaces_all(&self) -> bool {
        self.payload.play_behavior.as_deref() == Some(PLAY_BEHAVIOR_REPLACE_ALL)
    }

    #[must_use]
    pub fn replaces_enqueued(&self) -> bool {
        self.payload.play_behavior.as_deref() == Some(PLAY_BEHAVIOR_REPLACE_ENQUEUED)
    }
}
