//! Translation of wire directives into typed commands.
//!
//! Directives arrive as loosely typed JSON envelopes; this module turns
//! them into a closed [`Command`] enum keyed on the `(namespace, name)`
//! header pair, so everything downstream can match exhaustively. Names the
//! service introduces after this build land in [`Command::Unrecognized`]
//! instead of being silently dropped.

use std::time::Duration;

use time::{
    format_description::{well_known::Rfc3339, BorrowedFormatItem},
    macros::format_description,
    OffsetDateTime,
};

use crate::protocol::directive::Directive;

/// A scheduled alert from a `SetAlert` directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    /// Opaque token identifying the alert in later lifecycle events.
    pub token: String,

    /// Alert category, `TIMER` or `ALARM` as sent by the service.
    pub kind: String,

    /// Scheduled fire time, as the ISO 8601 string from the wire.
    pub scheduled_time: String,
}

/// `scheduledTime` arrives as RFC 3339 or, from older endpoints, with a
/// bare `+0000` style offset.
const COMPACT_OFFSET: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour][offset_minute]"
);

impl Alert {
    /// Parses the scheduled fire time.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the time string matches neither accepted
    /// format.
    pub fn scheduled_at(&self) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(&self.scheduled_time, &Rfc3339)
            .or_else(|_| OffsetDateTime::parse(&self.scheduled_time, COMPACT_OFFSET))
    }

    /// Time remaining until the alert fires, `None` once it is due.
    #[must_use]
    pub fn time_until_due(&self) -> Option<Duration> {
        let at = self.scheduled_at().ok()?;
        let remaining = at - OffsetDateTime::now_utc();
        remaining.try_into().ok()
    }
}

/// A transport control key pressed on the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKey {
    Play,
    Pause,
    Next,
    Previous,
}

/// A playable item from a `Play` or `Speak` directive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Media {
    /// Opaque token echoed back in playback lifecycle events.
    pub token: String,

    /// Remote stream URL, empty when the audio is embedded.
    pub url: String,

    /// Embedded audio bytes resolved from the multipart response.
    pub audio: Option<Vec<u8>>,

    /// Resume offset into the stream.
    pub offset: Duration,
}

impl Media {
    /// Whether the audio arrived inline rather than by URL.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.audio.is_some()
    }
}

/// One instruction from the service, decoded from a directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Marker: drop the entire queue, current item included, before the
    /// commands that follow.
    ClearAll,

    /// Marker: drop everything queued behind the current item.
    ClearEnqueued,

    /// Speak a synthesized utterance.
    Speak(Media),

    /// Start or enqueue media playback.
    Play(Media),

    /// Stop the current playback.
    Stop,

    /// Close the microphone immediately.
    StopCapture,

    /// Reopen the microphone for a follow-up utterance.
    ExpectSpeech {
        /// How long to wait for speech before giving up.
        timeout: Duration,
    },

    /// Schedule an alert.
    SetAlert(Alert),

    /// Cancel a previously scheduled alert.
    DeleteAlert {
        token: String,
    },

    /// Set the absolute output volume, 0 to 100.
    SetVolume {
        volume: i64,
    },

    /// Adjust the output volume by a signed delta.
    AdjustVolume {
        delta: i64,
    },

    /// Mute or unmute the output.
    SetMute {
        mute: bool,
    },

    /// A transport key routed through the service.
    MediaKey(MediaKey),

    /// The service reported a fault with the last request.
    ServerError {
        code: String,
        description: String,
    },

    /// Switch all subsequent calls to a different regional endpoint.
    SetEndpoint {
        endpoint: String,
    },

    /// A `(namespace, name)` pair this build does not know.
    Unrecognized {
        namespace: String,
        name: String,
    },
}

impl Command {
    /// Decodes one directive by its `(namespace, name)` header pair.
    #[must_use]
    pub fn from_directive(directive: Directive) -> Self {
        let namespace = directive.header.namespace.as_str();
        let name = directive.header.name.as_str();

        match (namespace, name) {
            ("SpeechSynthesizer", "Speak") => Self::Speak(Media {
                token: directive.payload.token().to_owned(),
                url: directive.payload.url.clone(),
                audio: directive.audio,
                offset: Duration::ZERO,
            }),
            ("AudioPlayer", "Play") => {
                let stream = directive
                    .payload
                    .audio_item
                    .as_ref()
                    .and_then(|item| item.stream.as_ref());
                Self::Play(Media {
                    token: directive.payload.token().to_owned(),
                    url: stream.map(|s| s.url.clone()).unwrap_or_default(),
                    audio: directive.audio,
                    offset: Duration::from_millis(
                        stream.map_or(0, |s| s.offset_in_milliseconds),
                    ),
                })
            }
            ("AudioPlayer", "Stop") => Self::Stop,
            ("SpeechRecognizer", "StopCapture") => Self::StopCapture,
            ("SpeechRecognizer", "ExpectSpeech") => Self::ExpectSpeech {
                timeout: Duration::from_millis(directive.payload.timeout_in_milliseconds),
            },
            ("Alerts", "SetAlert") => Self::SetAlert(Alert {
                token: directive.payload.token().to_owned(),
                kind: directive.payload.alert_type.clone(),
                scheduled_time: directive.payload.scheduled_time.clone(),
            }),
            ("Alerts", "DeleteAlert") => Self::DeleteAlert {
                token: directive.payload.token().to_owned(),
            },
            ("Speaker", "SetVolume") => Self::SetVolume {
                volume: directive.payload.volume,
            },
            ("Speaker", "AdjustVolume") => Self::AdjustVolume {
                delta: directive.payload.volume,
            },
            ("Speaker", "SetMute") => Self::SetMute {
                mute: directive.payload.mute,
            },
            ("PlaybackController", "PlayCommandIssued") => Self::MediaKey(MediaKey::Play),
            ("PlaybackController", "PauseCommandIssued") => Self::MediaKey(MediaKey::Pause),
            ("PlaybackController", "NextCommandIssued") => Self::MediaKey(MediaKey::Next),
            // Some service versions truncate the final "d".
            ("PlaybackController", "PreviousCommandIssued" | "PreviousCommandIssue") => {
                Self::MediaKey(MediaKey::Previous)
            }
            ("System", "SetEndpoint") => Self::SetEndpoint {
                endpoint: directive.payload.endpoint.clone(),
            },
            (_, "Exception") => Self::ServerError {
                code: directive.payload.code.clone(),
                description: directive.payload.description.clone().unwrap_or_default(),
            },
            _ => Self::Unrecognized {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            },
        }
    }
}

/// An ordered batch of commands decoded from one service response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub commands: Vec<Command>,
}

impl Batch {
    /// Assembles a batch, expanding play behaviors into queue markers.
    ///
    /// A replace-all play directive contributes a [`Command::ClearAll`]
    /// marker at the very front of the batch; replace-enqueued contributes
    /// a [`Command::ClearEnqueued`] marker immediately before its item.
    #[must_use]
    pub fn from_directives(directives: Vec<Directive>) -> Self {
        let mut commands = Vec::with_capacity(directives.len());

        for directive in directives {
            let replaces_all = directive.replaces_all();
            let replaces_enqueued = directive.replaces_enqueued();
            let command = Command::from_directive(directive);

            if let Command::Unrecognized { namespace, name } = &command {
                warn!("ignoring unrecognized directive {namespace}:{name}");
            }

            if replaces_all {
                commands.insert(0, Command::ClearAll);
            } else if replaces_enqueued {
                commands.push(Command::ClearEnqueued);
            }
            commands.push(command);
        }

        Self { commands }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(json: &str) -> Directive {
        Directive::from_json(json).unwrap()
    }

    #[test]
    fn dispatch_is_keyed_on_namespace_and_name() {
        // Same name under the wrong namespace must not dispatch.
        let wrong = directive(
            r#"{"header":{"namespace":"AudioPlayer","name":"SetVolume"},"payload":{"volume":50}}"#,
        );
        assert!(matches!(
            Command::from_directive(wrong),
            Command::Unrecognized { .. }
        ));

        let right = directive(
            r#"{"header":{"namespace":"Speaker","name":"SetVolume"},"payload":{"volume":50}}"#,
        );
        assert_eq!(
            Command::from_directive(right),
            Command::SetVolume { volume: 50 }
        );
    }

    #[test]
    fn play_pulls_stream_details() {
        let json = r#"{"header":{"namespace":"AudioPlayer","name":"Play"},"payload":{"playBehavior":"ENQUEUE","audioItem":{"audioItemId":"a1","stream":{"url":"https://cdn/x.mp3","token":"t-play","offsetInMilliseconds":1500}}}}"#;
        let Command::Play(media) = Command::from_directive(directive(json)) else {
            panic!("expected Play");
        };
        assert_eq!(media.token, "t-play");
        assert_eq!(media.url, "https://cdn/x.mp3");
        assert_eq!(media.offset, Duration::from_millis(1500));
        assert!(!media.is_embedded());
    }

    #[test]
    fn speak_carries_embedded_audio() {
        let json = r#"{"header":{"namespace":"SpeechSynthesizer","name":"Speak"},"payload":{"token":"t-speak","url":"cid:deadbeef"}}"#;
        let mut d = directive(json);
        d.audio = Some(vec![1, 2, 3]);
        let Command::Speak(media) = Command::from_directive(d) else {
            panic!("expected Speak");
        };
        assert_eq!(media.token, "t-speak");
        assert_eq!(media.audio, Some(vec![1, 2, 3]));
    }

    #[test]
    fn truncated_previous_name_still_dispatches() {
        for name in ["PreviousCommandIssued", "PreviousCommandIssue"] {
            let json = format!(
                r#"{{"header":{{"namespace":"PlaybackController","name":"{name}"}},"payload":{{}}}}"#
            );
            assert_eq!(
                Command::from_directive(directive(&json)),
                Command::MediaKey(MediaKey::Previous)
            );
        }
    }

    #[test]
    fn alert_time_parses_both_offset_styles() {
        for scheduled in ["2026-08-29T19:20:30+00:00", "2026-08-29T19:20:30+0000"] {
            let alert = Alert {
                token: "t".to_owned(),
                kind: "TIMER".to_owned(),
                scheduled_time: scheduled.to_owned(),
            };
            let at = alert.scheduled_at().unwrap();
            assert_eq!(at.hour(), 19);
        }
    }

    #[test]
    fn replace_all_marker_leads_the_batch() {
        let speak = directive(
            r#"{"header":{"namespace":"SpeechSynthesizer","name":"Speak"},"payload":{"token":"t-1"}}"#,
        );
        let play = directive(
            r#"{"header":{"namespace":"AudioPlayer","name":"Play"},"payload":{"playBehavior":"REPLACE_ALL","audioItem":{"stream":{"url":"https://cdn/x.mp3","token":"t-2"}}}}"#,
        );

        let batch = Batch::from_directives(vec![play, speak]);
        assert!(matches!(batch.commands[0], Command::ClearAll));
        assert!(matches!(batch.commands[1], Command::Play(_)));
        assert!(matches!(batch.commands[2], Command::Speak(_)));
    }

    #[test]
    fn replace_enqueued_marker_precedes_its_item() {
        let play = directive(
            r#"{"header":{"namespace":"AudioPlayer","name":"Play"},"payload":{"playBehavior":"REPLACE_ENQUEUED","audioItem":{"stream":{"url":"https://cdn/y.mp3","token":"t-3"}}}}"#,
        );

        let batch = Batch::from_directives(vec![play]);
        assert!(matches!(batch.commands[0], Command::ClearEnqueued));
        assert!(matches!(batch.commands[1], Command::Play(_)));
    }
}
