//! The device engine.
//!
//! Owns the model and the two long-lived flows around it: bring-up
//! (discovery over synchronous exchanges) and the read loop that applies
//! subscription pushes afterwards. The transport's read side has exactly one
//! consumer at a time; once the read loop starts, no synchronous exchange is
//! made again.

use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache, discovery,
    model::{Block, BlockType, Device},
    proto::{self, Command, IntoTTP, Response},
    router,
    transport::{self, Connection},
};

/// Poll interval of the read loop when the inbound buffer is empty
const READ_TICK: Duration = Duration::from_millis(10);

/// Tunables for bringing the engine up
#[derive(Debug, Clone)]
pub struct Options {
    /// Previously saved attribute document to try before probing
    pub cache_file: Option<PathBuf>,
    /// Where fresh probe results are persisted
    pub cache_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_file: None,
            cache_dir: PathBuf::from(cache::DEFAULT_DIR),
        }
    }
}

/// Bring-up failure; the gateway cannot run without a discovered device
#[derive(Debug, Error)]
pub enum StartError {
    /// Discovery could not complete
    #[error("device discovery failed: {0}")]
    Discovery(#[from] discovery::Error),
    /// Subscriptions could not be issued
    #[error("subscription setup failed: {0}")]
    Subscribe(#[from] transport::Error),
}

/// Caller-facing failure of a control operation
#[derive(Debug, Error)]
pub enum ControlError {
    /// Discovery has not completed
    #[error("device not ready")]
    NotReady,
    /// No block with that ID was discovered
    #[error("block does not exist: {0}")]
    NoSuchBlock(String),
    /// The channel index is not part of the block
    #[error("invalid channel {channel} for block {block}")]
    NoSuchChannel {
        /// Block the request addressed
        block: String,
        /// Offending channel index
        channel: u32,
    },
    /// The block's type cannot perform the operation
    #[error("block type {kind:?} does not support {operation} ({block})")]
    UnsupportedForBlockType {
        /// Block the request addressed
        block: String,
        /// Its discovered type
        kind: BlockType,
        /// What was asked of it
        operation: &'static str,
    },
    /// A level outside the channel's device-reported range
    #[error(
        "level on {block} channel {channel} must be between {minimum} and {maximum}, wanted {value}"
    )]
    OutOfRange {
        /// Block the request addressed
        block: String,
        /// Offending channel index
        channel: u32,
        /// Lower bound reported by the device
        minimum: f64,
        /// Upper bound reported by the device
        maximum: f64,
        /// Requested level
        value: f64,
    },
    /// The session is down and the command could not be queued
    #[error("device transport is down")]
    TransportDown,
    /// Source-selector writes are parked until their wire form is confirmed
    #[error("source selection command not verified for this device")]
    SourceSelectorUnverified,
}

/// Device identity, as reported by the landing endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Info {
    /// Device hostname
    pub hostname: String,
    /// Firmware version string
    pub version: String,
}

struct Shared {
    conn: Arc<dyn Connection>,
    device: RwLock<Device>,
    ready: AtomicBool,
    exit: AtomicBool,
}

/// Handle to a running engine
pub struct Dsp {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Dsp {
    /// Bring the device up.
    ///
    /// Blocks until the transport is active and discovery has completed;
    /// on return the engine is ready and live updates flow into the model.
    pub fn start(conn: Arc<dyn Connection>, options: Options) -> Result<Dsp, StartError> {
        debug!("waiting for connection");
        while !conn.active() {
            thread::sleep(Duration::from_millis(100));
        }
        debug!("device connected");

        let device = discovery::discover(
            conn.as_ref(),
            options.cache_file.as_deref(),
            &options.cache_dir,
        )?;

        let shared = Arc::new(Shared {
            conn: conn.clone(),
            device: RwLock::new(device),
            ready: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        });

        // The read loop must be draining before subscriptions are issued, as
        // the device starts pushing the moment it accepts one
        let generation = conn.generation();
        let weak = Arc::downgrade(&shared);
        let reader = thread::spawn(move || read_loop(weak, generation));

        let dsp = Dsp {
            shared,
            reader: Mutex::new(Some(reader)),
        };
        dsp.subscribe_all()?;
        dsp.shared.ready.store(true, Ordering::Relaxed);
        Ok(dsp)
    }

    fn subscribe_all(&self) -> Result<(), transport::Error> {
        debug!("setting up subscriptions");
        let (lines, blocks) = {
            let device = self.shared.device.read();
            let blocks = device
                .supported_blocks()
                .filter(|b| !b.kind.subscriptions().is_empty())
                .count();
            (subscribe_commands(&device), blocks)
        };
        for line in lines {
            self.shared.conn.send(&line)?;
        }
        info!("subscribed to updates from {blocks} blocks");
        Ok(())
    }

    /// Discovery has completed and the model is live
    pub fn ready(&self) -> bool {
        self.shared.ready.load(Ordering::Relaxed)
    }

    fn ensure_ready(&self) -> Result<(), ControlError> {
        if self.ready() {
            Ok(())
        } else {
            Err(ControlError::NotReady)
        }
    }

    /// Device identity
    pub fn info(&self) -> Result<Info, ControlError> {
        self.ensure_ready()?;
        let device = self.shared.device.read();
        Ok(Info {
            hostname: device.hostname.clone(),
            version: device.firmware.clone(),
        })
    }

    /// IDs of every discovered block
    pub fn blocks(&self) -> Result<Vec<String>, ControlError> {
        self.ensure_ready()?;
        Ok(self
            .shared
            .device
            .read()
            .blocks
            .iter()
            .map(|b| b.id.clone())
            .collect())
    }

    /// Blocks the gateway can drive, with their types
    pub fn supported_blocks(&self) -> Result<Vec<(String, BlockType)>, ControlError> {
        self.ensure_ready()?;
        Ok(self
            .shared
            .device
            .read()
            .supported_blocks()
            .map(|b| (b.id.clone(), b.kind))
            .collect())
    }

    /// Full record of one block
    pub fn block(&self, id: &str) -> Result<Option<Block>, ControlError> {
        self.ensure_ready()?;
        let block = self.shared.device.read().block(id).cloned();
        if block.is_none() {
            warn!("invalid block access attempt: {id}");
        }
        Ok(block)
    }

    /// Mute or unmute a channel; channel 0 fans out to every channel.
    ///
    /// Returns the channels commands were queued for. Confirmation arrives
    /// asynchronously through the mute subscription.
    pub fn set_mute(
        &self,
        block_id: &str,
        channel: u32,
        value: bool,
    ) -> Result<Vec<u32>, ControlError> {
        self.ensure_ready()?;
        let channels = {
            let device = self.shared.device.read();
            let block = device
                .block(block_id)
                .ok_or_else(|| ControlError::NoSuchBlock(block_id.to_owned()))?;
            if !block.kind.supports_mute() {
                return Err(ControlError::UnsupportedForBlockType {
                    block: block_id.to_owned(),
                    kind: block.kind,
                    operation: "muting",
                });
            }
            expand_channels(block, channel)?
        };

        for c in &channels {
            self.send(Command::set_mute(block_id, *c, value))?;
        }
        info!("set mute on {block_id}: {value}");
        Ok(channels)
    }

    /// Set the gain of a channel; channel 0 fans out to every channel.
    ///
    /// A value outside a channel's device-reported range is rejected when
    /// that channel was addressed directly, and skipped with a warning when
    /// reached through fan-out.
    pub fn set_level(
        &self,
        block_id: &str,
        channel: u32,
        value: f64,
    ) -> Result<Vec<u32>, ControlError> {
        self.ensure_ready()?;
        let fan_out = channel == 0;
        let targets = {
            let device = self.shared.device.read();
            let block = device
                .block(block_id)
                .ok_or_else(|| ControlError::NoSuchBlock(block_id.to_owned()))?;
            if !block.kind.has_level() {
                return Err(ControlError::UnsupportedForBlockType {
                    block: block_id.to_owned(),
                    kind: block.kind,
                    operation: "level control",
                });
            }

            let mut targets = Vec::new();
            for c in expand_channels(block, channel)? {
                let Some(level) = block.channels.get(&c).and_then(|ch| ch.level.as_ref()) else {
                    warn!("channel {c} of {block_id} has no level range, skipping");
                    continue;
                };
                if level.minimum <= value && value <= level.maximum {
                    targets.push(c);
                } else if fan_out {
                    warn!(
                        "invalid level setting on {block_id} channel {c}, must be between {} and {}, wanted {value}",
                        level.minimum, level.maximum
                    );
                } else {
                    return Err(ControlError::OutOfRange {
                        block: block_id.to_owned(),
                        channel: c,
                        minimum: level.minimum,
                        maximum: level.maximum,
                        value,
                    });
                }
            }
            targets
        };

        for c in &targets {
            self.send(Command::set_level(block_id, *c, value))?;
        }
        info!("set level on {block_id} (channels {targets:?}): {value}");
        Ok(targets)
    }

    /// Select the active source of a selector block.
    ///
    /// The selection command's wire form is not confirmed for this device
    /// family yet, so after validating the request this reports
    /// [`ControlError::SourceSelectorUnverified`] instead of sending a guess.
    // TODO: confirm the source selection command syntax against the Tesira
    // Text Protocol reference, then emit it here
    pub fn set_source_select(&self, block_id: &str, source: &str) -> Result<(), ControlError> {
        self.require_selector(block_id, "source selection")?;
        debug!("source selection requested on {block_id}: {source}");
        Err(ControlError::SourceSelectorUnverified)
    }

    /// Set the input gain of one source of a selector block.
    ///
    /// Parked for the same reason as [`Dsp::set_source_select`].
    pub fn set_source_level(
        &self,
        block_id: &str,
        source: u32,
        value: f64,
    ) -> Result<(), ControlError> {
        self.require_selector(block_id, "source level control")?;
        debug!("source level requested on {block_id}: {source} -> {value}");
        Err(ControlError::SourceSelectorUnverified)
    }

    fn require_selector(&self, block_id: &str, operation: &'static str) -> Result<(), ControlError> {
        self.ensure_ready()?;
        let device = self.shared.device.read();
        let block = device
            .block(block_id)
            .ok_or_else(|| ControlError::NoSuchBlock(block_id.to_owned()))?;
        if block.kind != BlockType::SourceSelector {
            return Err(ControlError::UnsupportedForBlockType {
                block: block_id.to_owned(),
                kind: block.kind,
                operation,
            });
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), ControlError> {
        self.shared.conn.send(&command.into_ttp()).map_err(|e| {
            warn!("command send failed: {e}");
            ControlError::TransportDown
        })
    }

    /// Stop the read loop, then close the transport
    pub fn close(&self) {
        self.shared.exit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        self.shared.conn.close();
    }
}

impl Drop for Dsp {
    fn drop(&mut self) {
        self.close();
    }
}

fn expand_channels(block: &Block, channel: u32) -> Result<Vec<u32>, ControlError> {
    if channel == 0 {
        debug!("request targets all channels of {}", block.id);
        Ok(block.channels.keys().copied().collect())
    } else if block.channels.contains_key(&channel) {
        Ok(vec![channel])
    } else {
        Err(ControlError::NoSuchChannel {
            block: block.id.clone(),
            channel,
        })
    }
}

/// Subscribe lines for every supported block, per its type's feeds
fn subscribe_commands(device: &Device) -> Vec<String> {
    let mut lines = Vec::new();
    for block in device.supported_blocks() {
        for kind in block.kind.subscriptions() {
            lines.push(Command::new_subscribe(block.id.clone(), *kind).into_ttp());
        }
    }
    lines
}

/// Drains the transport, extracts frames and routes subscription updates.
///
/// Holds only a weak handle so the engine (and its model) can be torn down
/// while the loop is parked between ticks.
fn read_loop(shared: Weak<Shared>, mut generation: u64) {
    debug!("read loop init");
    let mut buffer = String::new();
    loop {
        let Some(shared) = shared.upgrade() else { break };
        if shared.exit.load(Ordering::Relaxed) {
            break;
        }

        if shared.conn.active() {
            let current = shared.conn.generation();
            if current != generation {
                generation = current;
                // A partial line from the dead session must not leak into
                // the fresh stream
                buffer.clear();
                if shared.ready.load(Ordering::Relaxed) {
                    info!("session re-established, renewing subscriptions");
                    for line in subscribe_commands(&shared.device.read()) {
                        if let Err(e) = shared.conn.send(&line) {
                            warn!("re-subscribe failed: {e}");
                            break;
                        }
                    }
                }
            }

            while shared.conn.recv_ready() {
                match shared.conn.recv() {
                    Ok(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                    Err(_) => break,
                }
            }

            for frame in proto::parser::extract_frames(&mut buffer) {
                match frame {
                    Response::Subscription(update) => {
                        router::apply(&mut shared.device.write(), &update);
                    }
                    Response::Ok(body) => debug!("command response: {body:?}"),
                    Response::Err(e) => warn!("device error response: {e}"),
                }
            }
        }

        drop(shared);
        thread::sleep(READ_TICK);
    }
    debug!("read loop terminated");
}


#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::testing::{started, wait_until};
    use super::*;

    #[test]
    fn start_discovers_and_subscribes() {
        let (conn, dsp, _dir) = started();
        assert!(dsp.ready());
        assert_eq!(
            dsp.info().unwrap(),
            Info {
                hostname: "forte".to_owned(),
                version: "4.6.1.2".to_owned(),
            }
        );

        let sent = conn.sent();
        assert_eq!(
            sent,
            vec![
                "\"Gain1\" subscribe levels \"S_LVLA_Gain1\"",
                "\"Gain1\" subscribe mutes \"S_MUTA_Gain1\"",
                "\"Mute1\" subscribe mutes \"S_MUTA_Mute1\"",
                "\"USB1\" subscribe streaming \"S_USTR_USB1\"",
                "\"USB1\" subscribe connected \"S_UCON_USB1\"",
            ]
        );

        // Sel1 is typed but not drivable
        let supported = dsp.supported_blocks().unwrap();
        assert!(!supported.iter().any(|(id, _)| id == "Sel1"));
        assert_eq!(dsp.blocks().unwrap().len(), 4);
    }

    #[test]
    fn pushed_levels_reach_the_model() {
        let (conn, dsp, _dir) = started();
        conn.push("! \"publishToken\":\"S_LVLA_Gain1\" \"value\":[ -10.000000 -20.000000 ]\r\n");
        wait_until("levels to apply", || {
            dsp.block("Gain1")
                .unwrap()
                .and_then(|b| b.channels[&1].level.as_ref().map(|l| l.current))
                == Some(-10.0)
        });
        let gain = dsp.block("Gain1").unwrap().unwrap();
        assert_eq!(gain.channels[&2].level.as_ref().unwrap().current, -20.0);
    }

    #[test]
    fn pushed_usb_state_reaches_the_model() {
        let (conn, dsp, _dir) = started();
        conn.push("! \"publishToken\":\"S_UCON_USB1\" \"value\":true\r\n");
        wait_until("USB state to apply", || {
            dsp.block("USB1")
                .unwrap()
                .and_then(|b| b.usb)
                .map(|usb| usb.connected)
                == Some(true)
        });
    }

    #[test]
    fn mute_fans_out_over_channel_zero() {
        let (conn, dsp, _dir) = started();
        let channels = dsp.set_mute("Gain1", 0, true).unwrap();
        assert_eq!(channels, vec![1, 2]);
        let sent = conn.sent();
        assert!(sent.contains(&"\"Gain1\" set mute 1 true".to_owned()));
        assert!(sent.contains(&"\"Gain1\" set mute 2 true".to_owned()));
    }

    #[test]
    fn mute_validates_block_and_channel() {
        let (_conn, dsp, _dir) = started();
        assert!(matches!(
            dsp.set_mute("Ghost", 1, true),
            Err(ControlError::NoSuchBlock(_))
        ));
        assert!(matches!(
            dsp.set_mute("Gain1", 7, true),
            Err(ControlError::NoSuchChannel { channel: 7, .. })
        ));
        assert!(matches!(
            dsp.set_mute("USB1", 1, true),
            Err(ControlError::UnsupportedForBlockType { .. })
        ));
    }

    #[test]
    fn muting_a_selector_expands_to_nothing() {
        let (conn, dsp, _dir) = started();
        let before = conn.sent().len();
        assert_eq!(dsp.set_mute("Sel1", 0, true).unwrap(), Vec::<u32>::new());
        assert_eq!(conn.sent().len(), before);
    }

    #[test]
    fn level_rejects_out_of_range_direct_targets() {
        let (conn, dsp, _dir) = started();
        assert_eq!(dsp.set_level("Gain1", 1, -20.0).unwrap(), vec![1]);
        assert!(
            conn.sent()
                .contains(&"\"Gain1\" set level 1 -20".to_owned())
        );

        assert!(matches!(
            dsp.set_level("Gain1", 1, 100.0),
            Err(ControlError::OutOfRange {
                channel: 1,
                ..
            })
        ));
        assert!(matches!(
            dsp.set_level("Mute1", 1, 0.0),
            Err(ControlError::UnsupportedForBlockType { .. })
        ));
    }

    #[test]
    fn level_fan_out_skips_out_of_range_channels() {
        let (conn, dsp, _dir) = started();
        let before = conn.sent().len();
        assert_eq!(dsp.set_level("Gain1", 0, 100.0).unwrap(), Vec::<u32>::new());
        assert_eq!(conn.sent().len(), before);
    }

    #[test]
    fn source_selector_writes_are_parked() {
        let (_conn, dsp, _dir) = started();
        assert!(matches!(
            dsp.set_source_select("Sel1", "HDMI"),
            Err(ControlError::SourceSelectorUnverified)
        ));
        assert!(matches!(
            dsp.set_source_level("Sel1", 1, 0.0),
            Err(ControlError::SourceSelectorUnverified)
        ));
        assert!(matches!(
            dsp.set_source_select("Gain1", "HDMI"),
            Err(ControlError::UnsupportedForBlockType { .. })
        ));
    }

    #[test]
    fn reconnect_renews_subscriptions() {
        let (conn, dsp, _dir) = started();
        let baseline = conn.sent().len();
        conn.bump_generation();
        wait_until("subscriptions to renew", || conn.sent().len() >= baseline + 5);
        let sent = conn.sent();
        assert_eq!(
            sent[baseline..].iter().collect::<Vec<_>>(),
            sent[..5].iter().collect::<Vec<_>>()
        );
        drop(dsp);
    }
}
