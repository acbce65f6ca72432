//! Protocol types and command encoding for the Tesira Text Protocol

pub mod parser;

use std::fmt::Display;

use thiserror::Error;

/// Name of the block a command operates on
pub type InstanceTag = String;

/// Payload of a bare `+OK` acknowledgement
pub const CMD_RESPONSE_OK: &str = "cmd_response_ok";

/// A structured value received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A floating point number
    Number(f64),
    /// A boolean value
    Boolean(bool),
    /// Any string value
    Text(String),
}

impl Value {
    /// Coerce a raw token into a typed value.
    ///
    /// Anything that parses as a float is a number; the usual boolean words
    /// (`true`/`yes`/`on`, `false`/`no`/`off`, case-insensitive) become
    /// booleans; everything else stays text.
    pub fn normalise(raw: &str) -> Value {
        let token = raw.trim();
        if let Ok(number) = token.parse::<f64>() {
            return Value::Number(number);
        }
        match token.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Value::Boolean(true),
            "false" | "no" | "off" => Value::Boolean(false),
            _ => Value::Text(token.to_owned()),
        }
    }

    /// Numeric reading, for levels and channel counts
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Truthiness, for mute and USB status flags
    pub fn truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Boolean(b) => *b,
            Value::Text(s) => !s.is_empty(),
        }
    }

    /// Render as a channel label
    pub fn label(&self) -> String {
        match self {
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Text(s) => s.clone(),
        }
    }
}

/// A response from the device to a command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command was executed and returned a positive response
    Ok(OkBody),
    /// An error occured during command execution
    Err(ErrResponse),
    /// A value update for a subscription
    Subscription(Update),
}

/// Body of a positive response
#[derive(Debug, Clone, PartialEq)]
pub enum OkBody {
    /// A single value (a bare `+OK` carries [CMD_RESPONSE_OK])
    Value(Value),
    /// A list of values
    List(Vec<Value>),
    /// A body of a shape we do not interpret, kept verbatim
    Raw(String),
}

impl OkBody {
    /// The scalar payload, if this body carries one
    pub fn value(&self) -> Option<&Value> {
        match self {
            OkBody::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// An error produced by the device in response to a command
#[derive(Debug, Clone, PartialEq)]
pub struct ErrResponse {
    /// Device message decribing the error
    pub message: String,
}

impl Display for ErrResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A subscription push, already split out of its publish token
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// The 4-character subscription tag embedded in the token
    pub tag: String,
    /// The block the update belongs to
    pub block_id: String,
    /// The updated value(s)
    pub value: UpdateValue,
}

/// Value carried by a subscription update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateValue {
    /// A single value
    Scalar(Value),
    /// One value per channel
    List(Vec<Value>),
}

/// The state feeds a block can publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Per-channel levels
    Levels,
    /// Per-channel mute states
    Mutes,
    /// USB streaming flag
    Streaming,
    /// USB connected flag
    Connected,
}

impl SubscriptionKind {
    /// The attribute named in the subscribe command
    pub fn attribute(self) -> &'static str {
        match self {
            SubscriptionKind::Levels => "levels",
            SubscriptionKind::Mutes => "mutes",
            SubscriptionKind::Streaming => "streaming",
            SubscriptionKind::Connected => "connected",
        }
    }

    /// The fixed-width tag embedded in publish tokens
    pub fn tag(self) -> &'static str {
        match self {
            SubscriptionKind::Levels => "LVLA",
            SubscriptionKind::Mutes => "MUTA",
            SubscriptionKind::Streaming => "USTR",
            SubscriptionKind::Connected => "UCON",
        }
    }

    /// Reverse lookup from a publish-token tag
    pub fn from_tag(tag: &str) -> Option<SubscriptionKind> {
        match tag {
            "LVLA" => Some(SubscriptionKind::Levels),
            "MUTA" => Some(SubscriptionKind::Mutes),
            "USTR" => Some(SubscriptionKind::Streaming),
            "UCON" => Some(SubscriptionKind::Connected),
            _ => None,
        }
    }

    /// The publish token announcing updates of this kind for a block
    pub fn publish_token(self, block_id: &str) -> String {
        format!("S_{}_{}", self.tag(), block_id)
    }
}

/// A parsing error of response
#[derive(Debug, Error)]
pub enum ParseError {
    /// Line does not follow the response grammar
    #[error("response syntax error: {0}")]
    Syntax(String),
    /// A subscription update lacks a mandatory key
    #[error("subscription update missing \"{0}\"")]
    MissingField(&'static str),
    /// The publish token does not follow the `S_<tag>_<block>` shape
    #[error("malformed publish token: {0}")]
    BadPublishToken(String),
}

/// What a command addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The device service handle
    Device,
    /// The session service handle
    Session,
    /// A named block; quoted on the wire
    Block(InstanceTag),
}

/// Conversion trait to Tesira Text Protocol
pub trait IntoTTP {
    /// Convert this type to a Tesira Text Protocol value
    fn into_ttp(self) -> String;
}

impl IntoTTP for Target {
    fn into_ttp(self) -> String {
        match self {
            Target::Device => "DEVICE".to_owned(),
            Target::Session => "SESSION".to_owned(),
            // Block IDs may contain spaces and must always be quoted
            Target::Block(id) => format!("\"{id}\""),
        }
    }
}

impl IntoTTP for String {
    fn into_ttp(self) -> String {
        self
    }
}

impl IntoTTP for &str {
    fn into_ttp(self) -> String {
        self.to_owned()
    }
}

impl IntoTTP for bool {
    fn into_ttp(self) -> String {
        match self {
            true => "true".to_owned(),
            false => "false".to_owned(),
        }
    }
}

impl IntoTTP for u32 {
    fn into_ttp(self) -> String {
        self.to_string()
    }
}

impl IntoTTP for f64 {
    fn into_ttp(self) -> String {
        self.to_string()
    }
}

/// A client command that can be sent to the device
#[derive(Debug, Clone)]
pub struct Command<'a> {
    /// Service handle or block to apply the command on
    pub target: Target,
    /// Command verb: the gateway only ever gets, sets and subscribes
    pub verb: &'a str,
    /// Attribute to apply the command on
    pub attribute: &'a str,
    /// Optional channel indexes to specify the command target
    pub indexes: Vec<u32>,
    /// Optional values to add at command end
    pub values: Vec<String>,
}

impl<'a> Command<'a> {
    /// Create a new "get" command
    pub fn new_get(target: Target, attribute: &'a str, indexes: impl Into<Vec<u32>>) -> Self {
        Command {
            target,
            verb: "get",
            attribute,
            indexes: indexes.into(),
            values: Vec::new(),
        }
    }

    /// Create a new "set" command
    pub fn new_set(
        target: Target,
        attribute: &'a str,
        indexes: impl Into<Vec<u32>>,
        value: impl IntoTTP,
    ) -> Self {
        Command {
            target,
            verb: "set",
            attribute,
            indexes: indexes.into(),
            values: vec![value.into_ttp()],
        }
    }

    /// Create a new "subscribe" command carrying the tagged publish token
    pub fn new_subscribe(block_id: impl Into<InstanceTag>, kind: SubscriptionKind) -> Self {
        let block_id = block_id.into();
        let token = format!("\"{}\"", kind.publish_token(&block_id));
        Command {
            target: Target::Block(block_id),
            verb: "subscribe",
            attribute: kind.attribute(),
            indexes: Vec::new(),
            values: vec![token],
        }
    }

    /// Mute or unmute one channel of a block
    pub fn set_mute(block_id: impl Into<InstanceTag>, channel: u32, value: bool) -> Self {
        Command::new_set(Target::Block(block_id.into()), "mute", [channel], value)
    }

    /// Set the level of one channel of a block
    pub fn set_level(block_id: impl Into<InstanceTag>, channel: u32, value: f64) -> Self {
        Command::new_set(Target::Block(block_id.into()), "level", [channel], value)
    }
}

impl IntoTTP for Command<'_> {
    fn into_ttp(self) -> String {
        let mut cmd_ttp = format!(
            "{} {} {}",
            self.target.into_ttp(),
            self.verb,
            self.attribute
        );

        if !self.indexes.is_empty() {
            cmd_ttp.push(' ');
            cmd_ttp.push_str(
                self.indexes
                    .into_iter()
                    .map(|it| it.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .as_str(),
            );
        }

        if !self.values.is_empty() {
            cmd_ttp.push(' ');
            cmd_ttp.push_str(self.values.join(" ").as_str());
        }

        cmd_ttp
    }
}
