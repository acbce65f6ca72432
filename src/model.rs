//! In-memory representation of the device and its signal-graph blocks

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::proto::SubscriptionKind;

/// Interface type of a signal-graph block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockType {
    /// Per-channel gain fader
    LevelControl,
    /// Per-channel mute switch
    MuteControl,
    /// Dante network receive block
    DanteInput,
    /// Dante network transmit block
    DanteOutput,
    /// USB audio receive block
    UsbInput,
    /// USB audio transmit block
    UsbOutput,
    /// Built-in analogue output
    AudioOutput,
    /// Source selection matrix
    SourceSelector,
    /// Anything the gateway does not drive
    Unsupported,
}

// Unknown interface names collapse to Unsupported instead of failing the
// whole document
impl<'de> Deserialize<'de> for BlockType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(BlockType::from_interface(&name))
    }
}

impl BlockType {
    /// Map a device interface name (as extracted from the BLOCKTYPE probe)
    pub fn from_interface(name: &str) -> BlockType {
        match name {
            "LevelControl" => BlockType::LevelControl,
            "MuteControl" => BlockType::MuteControl,
            "DanteInput" => BlockType::DanteInput,
            "DanteOutput" => BlockType::DanteOutput,
            "UsbInput" => BlockType::UsbInput,
            "UsbOutput" => BlockType::UsbOutput,
            "AudioOutput" => BlockType::AudioOutput,
            "SourceSelector" => BlockType::SourceSelector,
            _ => BlockType::Unsupported,
        }
    }

    /// Types whose attributes and channels are queried during discovery
    pub fn probed(self) -> bool {
        !matches!(self, BlockType::SourceSelector | BlockType::Unsupported)
    }

    /// USB receive or transmit block
    pub fn is_usb(self) -> bool {
        matches!(self, BlockType::UsbInput | BlockType::UsbOutput)
    }

    /// Types carrying the ganged-controls flag
    pub fn has_ganged(self) -> bool {
        matches!(self, BlockType::LevelControl | BlockType::MuteControl)
    }

    /// Types with a per-channel gain range
    pub fn has_level(self) -> bool {
        matches!(
            self,
            BlockType::LevelControl
                | BlockType::DanteInput
                | BlockType::DanteOutput
                | BlockType::AudioOutput
        )
    }

    /// Types accepting mute commands
    pub fn supports_mute(self) -> bool {
        matches!(
            self,
            BlockType::LevelControl
                | BlockType::MuteControl
                | BlockType::DanteInput
                | BlockType::DanteOutput
                | BlockType::AudioOutput
                | BlockType::SourceSelector
        )
    }

    /// The attribute to query for a channel's name, if the type has one
    pub fn label_attribute(self) -> Option<&'static str> {
        match self {
            BlockType::DanteInput | BlockType::DanteOutput => Some("channelName"),
            // Built-in and USB channels cannot be named on the device
            BlockType::UsbInput | BlockType::UsbOutput | BlockType::AudioOutput => None,
            _ => Some("label"),
        }
    }

    /// The state feeds to subscribe to for this type
    pub fn subscriptions(self) -> &'static [SubscriptionKind] {
        match self {
            BlockType::LevelControl
            | BlockType::DanteInput
            | BlockType::DanteOutput
            | BlockType::AudioOutput => &[SubscriptionKind::Levels, SubscriptionKind::Mutes],
            BlockType::MuteControl => &[SubscriptionKind::Mutes],
            BlockType::UsbInput | BlockType::UsbOutput => {
                &[SubscriptionKind::Streaming, SubscriptionKind::Connected]
            }
            BlockType::SourceSelector | BlockType::Unsupported => &[],
        }
    }
}

/// Gain range and current position of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Last observed gain
    pub current: f64,
    /// Lower bound reported by the device
    pub minimum: f64,
    /// Upper bound reported by the device
    pub maximum: f64,
}

/// USB transport status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbState {
    /// Audio is moving over the USB transport
    pub streaming: bool,
    /// A host is attached
    pub connected: bool,
}

/// One audio lane within a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// 1-based channel index
    pub idx: u32,
    /// Channel name, device-assigned or synthesised
    pub label: String,
    /// Absent on USB blocks, which cannot publish mute state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    /// Present only on types with gain control
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
}

/// One node of the signal graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Alias of the block; carried as the key of the enclosing map
    #[serde(skip)]
    pub id: String,
    /// The gateway can drive this block
    pub supported: bool,
    /// Discovered interface type
    #[serde(rename = "type")]
    pub kind: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ganged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbState>,
    /// Channels keyed by their 1-based index
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<u32, Channel>,
}

impl Block {
    /// A freshly typed block, before any attribute probe
    pub fn new(id: impl Into<String>, kind: BlockType) -> Block {
        Block {
            id: id.into(),
            supported: false,
            kind,
            ganged: None,
            usb: None,
            channels: BTreeMap::new(),
        }
    }

    /// Number of channels discovered on the block
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// The device and everything discovered about it
#[derive(Debug, Clone, Default)]
pub struct Device {
    /// Device hostname
    pub hostname: String,
    /// Firmware version string
    pub firmware: String,
    /// Raw alias list, in device order
    pub aliases: Vec<String>,
    /// Blocks in discovery order
    pub blocks: Vec<Block>,
}

impl Device {
    /// Look a block up by its alias
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Mutable lookup by alias
    pub fn block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Add a block; a duplicate ID overwrites in place and reports it did
    pub fn insert_block(&mut self, block: Block) -> bool {
        match self.block_mut(&block.id) {
            Some(existing) => {
                *existing = block;
                true
            }
            None => {
                self.blocks.push(block);
                false
            }
        }
    }

    /// Blocks the gateway can drive
    pub fn supported_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.supported)
    }
}
