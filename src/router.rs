//! Applies subscription pushes to the device model.
//!
//! The router only ever touches live state: per-channel `muted` and
//! `level.current`, and the USB status flags. Everything else in the model
//! is owned by discovery.

use tracing::{debug, error, info};

use crate::{
    model::{BlockType, Device},
    proto::{SubscriptionKind, Update, UpdateValue, Value},
};

/// Route one update to its block; anything inconsistent drops the frame
pub fn apply(device: &mut Device, update: &Update) {
    let Some(kind) = SubscriptionKind::from_tag(&update.tag) else {
        error!("unknown subscription tag in {:?}", update.tag);
        return;
    };
    let Some(block) = device.block_mut(&update.block_id) else {
        error!("subscription update for unknown block {}", update.block_id);
        return;
    };

    match &update.value {
        UpdateValue::List(values) => {
            if values.len() != block.channels.len() {
                error!(
                    "{:?} update for {} carries {} values, block has {} channels",
                    kind,
                    block.id,
                    values.len(),
                    block.channels.len()
                );
                return;
            }
            match kind {
                // USB blocks cannot publish mute state, so an all-mutes
                // frame for one is bogus
                SubscriptionKind::Mutes if !block.kind.is_usb() => {
                    for (channel, value) in block.channels.values_mut().zip(values) {
                        channel.muted = Some(value.truthy());
                    }
                }
                SubscriptionKind::Levels if block.kind != BlockType::MuteControl => {
                    let Some(levels) = values
                        .iter()
                        .map(Value::as_number)
                        .collect::<Option<Vec<f64>>>()
                    else {
                        error!("non-numeric level update for {}: {values:?}", block.id);
                        return;
                    };
                    for (channel, value) in block.channels.values_mut().zip(levels) {
                        if let Some(level) = channel.level.as_mut() {
                            level.current = value;
                        }
                    }
                }
                _ => {
                    debug!("ignoring {kind:?} list update for {}", block.id);
                    return;
                }
            }
        }
        UpdateValue::Scalar(value) => {
            if !block.kind.is_usb() {
                debug!("ignoring scalar {kind:?} update for {}", block.id);
                return;
            }
            let Some(usb) = block.usb.as_mut() else {
                error!("USB status update for {} without USB state", block.id);
                return;
            };
            match kind {
                SubscriptionKind::Streaming => usb.streaming = value.truthy(),
                SubscriptionKind::Connected => usb.connected = value.truthy(),
                _ => {
                    debug!("ignoring scalar {kind:?} update for {}", block.id);
                    return;
                }
            }
        }
    }

    info!("{} attribute update {}: {:?}", update.block_id, kind.attribute(), update.value);
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{Block, Channel, Level, UsbState};

    fn update(tag: &str, block_id: &str, value: UpdateValue) -> Update {
        Update {
            tag: tag.to_owned(),
            block_id: block_id.to_owned(),
            value,
        }
    }

    fn level_block(id: &str, channels: u32) -> Block {
        let mut block = Block::new(id, BlockType::LevelControl);
        block.supported = true;
        block.ganged = Some(false);
        for idx in 1..=channels {
            block.channels.insert(
                idx,
                Channel {
                    idx,
                    label: format!("Ch{idx}"),
                    muted: Some(false),
                    level: Some(Level {
                        current: -100.0,
                        minimum: -100.0,
                        maximum: 12.0,
                    }),
                },
            );
        }
        block
    }

    fn usb_block(id: &str) -> Block {
        let mut block = Block::new(id, BlockType::UsbInput);
        block.supported = true;
        block.usb = Some(UsbState::default());
        block.channels.insert(
            1,
            Channel {
                idx: 1,
                label: "Channel1".to_owned(),
                muted: None,
                level: None,
            },
        );
        block
    }

    fn device() -> Device {
        Device {
            hostname: "forte".to_owned(),
            firmware: "4.6.1.2".to_owned(),
            aliases: vec!["Gain1".to_owned(), "USB1".to_owned()],
            blocks: vec![level_block("Gain1", 4), usb_block("USB1")],
        }
    }

    fn currents(device: &Device, id: &str) -> Vec<f64> {
        device.block(id).unwrap().channels
            .values()
            .map(|c| c.level.as_ref().unwrap().current)
            .collect()
    }

    #[test]
    fn should_apply_multi_channel_levels() {
        let mut device = device();
        apply(
            &mut device,
            &update(
                "LVLA",
                "Gain1",
                UpdateValue::List(vec![
                    Value::Number(-10.0),
                    Value::Number(-10.0),
                    Value::Number(-20.0),
                    Value::Number(-20.0),
                ]),
            ),
        );
        assert_eq!(currents(&device, "Gain1"), vec![-10.0, -10.0, -20.0, -20.0]);
    }

    #[test]
    fn should_apply_multi_channel_mutes() {
        let mut device = device();
        apply(
            &mut device,
            &update(
                "MUTA",
                "Gain1",
                UpdateValue::List(vec![
                    Value::Boolean(true),
                    Value::Boolean(false),
                    Value::Boolean(true),
                    Value::Boolean(false),
                ]),
            ),
        );
        let muted: Vec<Option<bool>> = device
            .block("Gain1")
            .unwrap()
            .channels
            .values()
            .map(|c| c.muted)
            .collect();
        assert_eq!(
            muted,
            vec![Some(true), Some(false), Some(true), Some(false)]
        );
    }

    #[test]
    fn batch_equals_per_channel_updates_in_order() {
        let mut batched = device();
        apply(
            &mut batched,
            &update(
                "MUTA",
                "Gain1",
                UpdateValue::List(vec![
                    Value::Boolean(true),
                    Value::Boolean(true),
                    Value::Boolean(false),
                    Value::Boolean(true),
                ]),
            ),
        );

        let mut stepped = device();
        for (idx, muted) in [(1u32, true), (2, true), (3, false), (4, true)] {
            let block = stepped.block_mut("Gain1").unwrap();
            block.channels.get_mut(&idx).unwrap().muted = Some(muted);
        }

        assert_eq!(batched.blocks, stepped.blocks);
    }

    #[test]
    fn should_update_usb_flags_from_scalars() {
        let mut device = device();
        apply(
            &mut device,
            &update("UCON", "USB1", UpdateValue::Scalar(Value::Boolean(true))),
        );
        assert_eq!(
            device.block("USB1").unwrap().usb,
            Some(UsbState {
                streaming: false,
                connected: true
            })
        );

        apply(
            &mut device,
            &update("USTR", "USB1", UpdateValue::Scalar(Value::Boolean(true))),
        );
        assert_eq!(
            device.block("USB1").unwrap().usb,
            Some(UsbState {
                streaming: true,
                connected: true
            })
        );
    }

    #[test]
    fn unknown_block_leaves_model_unchanged() {
        let mut device = device();
        let before = device.clone();
        apply(
            &mut device,
            &update("LVLA", "Ghost", UpdateValue::List(vec![Value::Number(0.0)])),
        );
        assert_eq!(device.blocks, before.blocks);
    }

    #[test]
    fn unknown_tag_leaves_model_unchanged() {
        let mut device = device();
        let before = device.clone();
        apply(
            &mut device,
            &update("XXXX", "Gain1", UpdateValue::Scalar(Value::Number(1.0))),
        );
        assert_eq!(device.blocks, before.blocks);
    }

    #[test]
    fn channel_count_mismatch_drops_the_frame() {
        let mut device = device();
        let before = device.clone();
        apply(
            &mut device,
            &update(
                "LVLA",
                "Gain1",
                UpdateValue::List(vec![Value::Number(-1.0), Value::Number(-2.0)]),
            ),
        );
        assert_eq!(device.blocks, before.blocks);
    }

    #[test]
    fn levels_for_a_mute_block_are_ignored() {
        let mut device = device();
        let mut mute = Block::new("Mute1", BlockType::MuteControl);
        mute.supported = true;
        mute.channels = BTreeMap::from([(
            1,
            Channel {
                idx: 1,
                label: "Ch1".to_owned(),
                muted: Some(false),
                level: None,
            },
        )]);
        device.blocks.push(mute);
        let before = device.clone();

        apply(
            &mut device,
            &update("LVLA", "Mute1", UpdateValue::List(vec![Value::Number(0.0)])),
        );
        assert_eq!(device.blocks, before.blocks);
    }

    #[test]
    fn invariants_hold_after_update_batches() {
        let mut device = device();
        for frame in [
            update("LVLA", "Gain1", UpdateValue::List(vec![Value::Number(-5.0); 4])),
            update("MUTA", "Gain1", UpdateValue::List(vec![Value::Boolean(true); 4])),
            update("USTR", "USB1", UpdateValue::Scalar(Value::Boolean(true))),
        ] {
            apply(&mut device, &frame);
        }

        for block in &device.blocks {
            let indexes: Vec<u32> = block.channels.keys().copied().collect();
            assert_eq!(indexes, (1..=block.channels.len() as u32).collect::<Vec<_>>());
            assert!(!block.supported || !block.channels.is_empty());
            for channel in block.channels.values() {
                if let Some(level) = &channel.level {
                    assert!(level.minimum <= level.current);
                    assert!(level.current <= level.maximum);
                }
            }
        }
    }
}
