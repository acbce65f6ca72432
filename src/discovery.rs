//! One-shot traversal that turns the device's alias list into typed blocks.
//!
//! Runs strictly before any subscription traffic, over synchronous
//! [`Connection::send_wait`] exchanges. The identity queries (hostname,
//! firmware, aliases) are mandatory; everything after that degrades
//! per block instead of failing the bring-up.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache,
    model::{Block, BlockType, Channel, Device, Level, UsbState},
    proto::{self, Command, ErrResponse, IntoTTP, OkBody, Response, Target, Value},
    transport::{self, Connection},
};

/// Error that can occur while querying the device configuration
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure during a synchronous exchange
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Received an error response
    #[error("operation failed on device: {0}")]
    OperationFailed(ErrResponse),
    /// Response did not carry what the query needed
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Discover the device: identity, aliases, protocol mode, then blocks
/// (from the attribute cache when it still matches, from live probes
/// otherwise). A live probe result is persisted under `cache_dir`.
pub fn discover(
    conn: &dyn Connection,
    cache_file: Option<&Path>,
    cache_dir: &Path,
) -> Result<Device, Error> {
    let hostname = query_value(conn, Command::new_get(Target::Device, "hostname", []))?.label();
    info!("device hostname: {hostname}");

    let firmware = query_value(conn, Command::new_get(Target::Device, "version", []))?.label();
    info!("device firmware version: {firmware}");

    let aliases: Vec<String> = query_list(conn, Command::new_get(Target::Session, "aliases", []))?
        .into_iter()
        .map(|v| v.label())
        .collect();
    debug!("found {} attribute aliases", aliases.len());

    // Single-line verbose responses, nothing more detailed
    for command in [
        Command::new_set(Target::Session, "verbose", [], true),
        Command::new_set(Target::Session, "detailedResponse", [], false),
    ] {
        if let Err(e) = exchange(conn, command) {
            warn!("protocol mode selection failed: {e}");
        }
    }

    let mut device = Device {
        hostname,
        firmware,
        aliases,
        blocks: Vec::new(),
    };

    if let Some(path) = cache_file {
        match cache::load(
            path,
            &device.hostname,
            &device.firmware,
            device.aliases.len(),
        ) {
            Ok(blocks) => {
                device.blocks = blocks;
                info!("block attributes loaded from cache file");
                return Ok(device);
            }
            Err(e) => warn!("cannot load cached block attributes: {e}"),
        }
    }

    info!("block attributes will be queried from the device (this may take a while)");
    probe_blocks(conn, &mut device);
    info!("block attributes loaded from device");

    match cache::save(cache_dir, &device) {
        Ok(path) => info!("block attributes saved: {}", path.display()),
        Err(e) => warn!("cannot save block attributes: {e}"),
    }

    Ok(device)
}

/// Type-probe every alias, then attribute-probe the drivable blocks
fn probe_blocks(conn: &dyn Connection, device: &mut Device) {
    let aliases = device.aliases.clone();
    let total = aliases.len();
    for (i, alias) in aliases.iter().enumerate() {
        let interface = match type_probe(conn, alias) {
            Ok(Some(interface)) => interface,
            // No attribute interface in the reply: the session handle or
            // some other non-block alias
            Ok(None) => continue,
            Err(e) => {
                warn!("type probe failed for {alias}: {e}");
                continue;
            }
        };

        let kind = BlockType::from_interface(&interface);
        debug!("(block discovery: {}/{total}) {alias} -> {interface}", i + 1);
        if device.insert_block(Block::new(alias.clone(), kind)) {
            warn!("duplicate alias {alias}, keeping the latest probe");
        }
    }

    let probe_targets: Vec<(String, BlockType)> = device
        .blocks
        .iter()
        .filter(|b| b.kind.probed())
        .map(|b| (b.id.clone(), b.kind))
        .collect();
    let total = probe_targets.len();
    for (i, (id, kind)) in probe_targets.into_iter().enumerate() {
        debug!("(block attribute query: {}/{total}) {id} -> {kind:?}", i + 1);
        match probe_attributes(conn, &id, kind) {
            Ok(block) => {
                device.insert_block(block);
            }
            Err(e) => warn!("attribute probe failed for {id}, leaving it unsupported: {e}"),
        }
    }
}

/// An intentionally invalid attribute query; the device names the block's
/// interface in its error reply, which is the only way to learn the type
fn type_probe(conn: &dyn Connection, alias: &str) -> Result<Option<String>, Error> {
    let response = exchange(
        conn,
        Command::new_get(Target::Block(alias.to_owned()), "BLOCKTYPE", []),
    )?;
    match response {
        Response::Err(e) => Ok(block_interface(&e.message)),
        _ => Ok(None),
    }
}

/// Pull `<type>Interface::Attributes` out of the probe diagnostic
fn block_interface(message: &str) -> Option<String> {
    let token = message.split_whitespace().last()?;
    if !token.contains("::Attributes") {
        return None;
    }
    Some(token.replace("Interface::Attributes", "").trim().to_owned())
}

/// Query ganged flag, channel count, labels and level ranges for one block
fn probe_attributes(conn: &dyn Connection, id: &str, kind: BlockType) -> Result<Block, Error> {
    let mut block = Block::new(id, kind);
    block.supported = true;

    if kind.has_ganged() {
        block.ganged = Some(query_value(conn, block_get(id, "ganged", []))?.truthy());
    }
    if kind.is_usb() {
        block.usb = Some(UsbState::default());
    }

    let channel_count = query_number(conn, block_get(id, "numChannels", []))? as u32;
    for idx in 1..=channel_count {
        let label = match kind.label_attribute() {
            Some(attribute) => query_value(conn, block_get(id, attribute, [idx]))?.label(),
            // Some blocks cannot name channels, substitute a placeholder
            None => format!("Channel{idx}"),
        };

        // USB blocks cannot publish mute state, so they carry none
        let muted = (!kind.is_usb()).then_some(false);

        let level = if kind.has_level() {
            let minimum = query_number(conn, block_get(id, "minLevel", [idx]))?;
            let maximum = query_number(conn, block_get(id, "maxLevel", [idx]))?;
            Some(Level {
                current: -100.0,
                minimum,
                maximum,
            })
        } else {
            None
        };

        block.channels.insert(
            idx,
            Channel {
                idx,
                label,
                muted,
                level,
            },
        );
    }

    Ok(block)
}

fn block_get<'a>(id: &str, attribute: &'a str, indexes: impl Into<Vec<u32>>) -> Command<'a> {
    Command::new_get(Target::Block(id.to_owned()), attribute, indexes)
}

/// Send a command and parse the first frame of its reply
fn exchange(conn: &dyn Connection, command: Command) -> Result<Response, Error> {
    let line = command.into_ttp();
    let mut buffer = String::from_utf8_lossy(&conn.send_wait(&line)?).into_owned();
    // The reply chunk may not be newline-terminated yet
    buffer.push('\n');
    proto::parser::extract_frames(&mut buffer)
        .into_iter()
        .next()
        .ok_or_else(|| Error::Unexpected(format!("no response frame for {line}")))
}

fn query_value(conn: &dyn Connection, command: Command) -> Result<Value, Error> {
    match exchange(conn, command)? {
        Response::Ok(body) => match body {
            OkBody::Value(value) => Ok(value),
            other => Err(Error::Unexpected(format!(
                "expected a scalar value, got {other:?}"
            ))),
        },
        Response::Err(e) => Err(Error::OperationFailed(e)),
        Response::Subscription(u) => Err(Error::Unexpected(format!(
            "subscription push during discovery: {u:?}"
        ))),
    }
}

fn query_number(conn: &dyn Connection, command: Command) -> Result<f64, Error> {
    let value = query_value(conn, command)?;
    value
        .as_number()
        .ok_or_else(|| Error::Unexpected(format!("expected a number, got {value:?}")))
}

fn query_list(conn: &dyn Connection, command: Command) -> Result<Vec<Value>, Error> {
    match exchange(conn, command)? {
        Response::Ok(OkBody::List(values)) => Ok(values),
        Response::Ok(other) => Err(Error::Unexpected(format!(
            "expected a list, got {other:?}"
        ))),
        Response::Err(e) => Err(Error::OperationFailed(e)),
        Response::Subscription(u) => Err(Error::Unexpected(format!(
            "subscription push during discovery: {u:?}"
        ))),
    }
}
