use crate::resp::Frame;
use crate::Identity;
use bytes::Bytes;
use std::time::Duration;

/// Command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Probe liveness, echoing the optional message.
    Ping(Option<Bytes>),
    /// Enqueue a message to `topic`.
    Produce {
        topic: String,
        key: Option<Bytes>,
        value: Bytes,
    },
    /// Flush enqueued messages.
    Flush(Option<Duration>),
    /// Consume the next message, binding the connection to a Consumer if `bind` is set.
    Consume {
        bind: Option<Binding>,
        timeout: Option<Duration>,
    },
    /// Set the Identity used by Blpop.
    SetName(Identity),
    GetName,
    /// Consume the next message of `topic`, using the SetName Identity.
    Blpop { topic: String, timeout: Duration },
    Quit,
}

/// Identity and topic to which a consuming connection binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub identity: Identity,
    pub topic: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(String);

// Key prefix which maps Redis list commands onto topics.
const TOPICS_PREFIX: &str = "topics:";

impl Command {
    pub fn parse(frame: Frame) -> Result<Self, ParseError> {
        let Frame::Array(items) = frame else {
            return Err(ParseError("expected a command array".to_string()));
        };
        let mut args = Vec::with_capacity(items.len());

        for item in items {
            match item {
                Frame::Bulk(b) => args.push(b),
                Frame::Simple(s) => args.push(Bytes::from(s)),
                _ => return Err(ParseError("command arguments must be strings".to_string())),
            }
        }
        let Some((name, args)) = args.split_first() else {
            return Err(ParseError("empty command".to_string()));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match (name.as_str(), args) {
            ("PING", []) => Ok(Command::Ping(None)),
            ("PING", [message]) => Ok(Command::Ping(Some(message.clone()))),

            ("PRODUCE", [topic, value]) => Ok(Command::Produce {
                topic: topic_name(topic)?,
                key: None,
                value: value.clone(),
            }),
            ("PRODUCE", [topic, value, key]) => Ok(Command::Produce {
                topic: topic_name(topic)?,
                key: Some(key.clone()),
                value: value.clone(),
            }),
            ("RPUSHX", [key, value]) => Ok(Command::Produce {
                topic: prefixed_topic(key)?,
                key: None,
                value: value.clone(),
            }),

            ("FLUSH" | "DUMP", []) => Ok(Command::Flush(None)),
            ("FLUSH" | "DUMP", [ms]) => Ok(Command::Flush(Some(millis(ms)?))),

            ("CONSUME", []) => Ok(Command::Consume {
                bind: None,
                timeout: None,
            }),
            ("CONSUME", [ms]) => Ok(Command::Consume {
                bind: None,
                timeout: Some(millis(ms)?),
            }),
            ("CONSUME", [topic, group, id]) => Ok(Command::Consume {
                bind: Some(binding(topic, group, id)?),
                timeout: None,
            }),
            ("CONSUME", [topic, group, id, ms]) => Ok(Command::Consume {
                bind: Some(binding(topic, group, id)?),
                timeout: Some(millis(ms)?),
            }),

            ("CLIENT", [sub, rest @ ..]) => {
                match (String::from_utf8_lossy(sub).to_ascii_uppercase().as_str(), rest) {
                    ("SETNAME", [name]) => {
                        let identity = text(name)?
                            .parse()
                            .map_err(|err: crate::Error| ParseError(err.to_string()))?;
                        Ok(Command::SetName(identity))
                    }
                    ("GETNAME", []) => Ok(Command::GetName),
                    (sub, _) => Err(ParseError(format!(
                        "unknown or malformed CLIENT subcommand '{sub}'"
                    ))),
                }
            }

            ("BLPOP", [key, secs]) => Ok(Command::Blpop {
                topic: prefixed_topic(key)?,
                timeout: seconds(secs)?,
            }),

            ("QUIT", []) => Ok(Command::Quit),

            (
                "PING" | "PRODUCE" | "RPUSHX" | "FLUSH" | "DUMP" | "CONSUME" | "CLIENT" | "BLPOP"
                | "QUIT",
                _,
            ) => Err(ParseError(format!(
                "wrong number of arguments for '{}' command",
                name.to_ascii_lowercase()
            ))),
            _ => Err(ParseError(format!(
                "unknown command '{}'",
                name.to_ascii_lowercase()
            ))),
        }
    }
}

fn text(b: &Bytes) -> Result<String, ParseError> {
    std::str::from_utf8(b)
        .map(str::to_string)
        .map_err(|_| ParseError("argument is not valid UTF-8".to_string()))
}

fn topic_name(b: &Bytes) -> Result<String, ParseError> {
    let topic = text(b)?;
    if topic.is_empty() {
        return Err(ParseError("topic may not be empty".to_string()));
    }
    Ok(topic)
}

fn prefixed_topic(b: &Bytes) -> Result<String, ParseError> {
    let key = text(b)?;
    match key.strip_prefix(TOPICS_PREFIX) {
        Some(topic) if !topic.is_empty() => Ok(topic.to_string()),
        _ => Err(ParseError(format!(
            "key '{key}' must have the form '{TOPICS_PREFIX}<topic>'"
        ))),
    }
}

fn binding(topic: &Bytes, group: &Bytes, id: &Bytes) -> Result<Binding, ParseError> {
    let identity = Identity::new(text(group)?, text(id)?)
        .map_err(|err| ParseError(err.to_string()))?;

    Ok(Binding {
        identity,
        topic: topic_name(topic)?,
    })
}

fn millis(b: &Bytes) -> Result<Duration, ParseError> {
    text(b)?
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ParseError("timeout is not a non-negative integer".to_string()))
}

// Redis BLPOP timeouts are seconds, and may be fractional.
fn seconds(b: &Bytes) -> Result<Duration, ParseError> {
    text(b)?
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ParseError("timeout is not a non-negative number".to_string()))
}
