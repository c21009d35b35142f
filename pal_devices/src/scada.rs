//! SCADA scan: tag database with per-tag poll rates, alarm limits, and
//! hysteresis.
//!
//! Tag values are polled from peer devices through the fabric and published
//! into the SCADA device's own memory map — tag `i` lands in input register
//! `i`, its alarm state in coil `i`. HMIs and protocol clients read the tag
//! database through those addresses.

use tracing::debug;

use crate::{ScanLogic, ScanResult};
use pal_common::config::{ScadaRoleConfig, TagConfig};
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// One tag's runtime state.
#[derive(Debug)]
struct TagState {
    cfg: TagConfig,
    /// Resolved canonical key on the peer (at install).
    key: Option<AddressKey>,
    next_poll: f64,
    last_value: f64,
    alarm_active: bool,
}

impl TagState {
    /// Alarm evaluation with hysteresis: an alarm raised at a limit clears
    /// only once the value retreats past the limit by the deadband.
    fn evaluate_alarm(&mut self) {
        let v = self.last_value;
        let c = &self.cfg;
        if self.alarm_active {
            let high_clear = c.alarm_high.is_none_or(|h| v < h - c.deadband);
            let low_clear = c.alarm_low.is_none_or(|l| v > l + c.deadband);
            if high_clear && low_clear {
                self.alarm_active = false;
            }
        } else {
            let high = c.alarm_high.is_some_and(|h| v >= h);
            let low = c.alarm_low.is_some_and(|l| v <= l);
            self.alarm_active = high || low;
        }
    }
}

/// Supervisory tag-database scan.
pub struct ScadaScan {
    device: String,
    tags: Vec<TagState>,
}

impl ScadaScan {
    /// Create a SCADA scan from its role configuration.
    pub fn new(device: impl Into<String>, cfg: ScadaRoleConfig) -> Self {
        Self {
            device: device.into(),
            tags: cfg
                .tags
                .into_iter()
                .map(|cfg| TagState {
                    cfg,
                    key: None,
                    next_poll: 0.0,
                    last_value: 0.0,
                    alarm_active: false,
                })
                .collect(),
        }
    }

    /// Current value of tag `idx` (raw engineering units).
    pub fn tag_value(&self, idx: usize) -> Option<f64> {
        self.tags.get(idx).map(|t| t.last_value)
    }

    /// Whether tag `idx` is in alarm.
    pub fn tag_alarm(&self, idx: usize) -> Option<bool> {
        self.tags.get(idx).map(|t| t.alarm_active)
    }

    /// Number of configured tags.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

impl ScanLogic for ScadaScan {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        let tag_count = self.tags.len() as u16;
        fabric.install(&self.device, |mem| {
            for i in 0..tag_count {
                mem.map_word(AddressKey::input(i), 0);
                mem.map_bit(AddressKey::coil(i), false);
            }
        })?;
        // Alias tag names to their slots and resolve peer keys.
        for (i, tag) in self.tags.iter_mut().enumerate() {
            let slot = AddressKey::input(i as u16);
            let name = tag.cfg.name.clone();
            fabric.install(&self.device, move |mem| mem.alias(name, slot))?;
            tag.key = Some(fabric.resolve_key(&tag.cfg.device, &tag.cfg.key)?);
        }
        Ok(())
    }

    fn scan(&mut self, now: f64, fabric: &Fabric) -> ScanResult<()> {
        let mut delta = Vec::new();
        for (i, tag) in self.tags.iter_mut().enumerate() {
            if now < tag.next_poll {
                continue;
            }
            tag.next_poll = now + tag.cfg.poll_interval_ms as f64 / 1000.0;

            let Some(key) = tag.key else { continue };
            let value = match fabric.read(&tag.cfg.device, key)? {
                Some(Value::Word(w)) => f64::from(w),
                Some(Value::Bit(b)) => u8::from(b) as f64,
                None => continue,
            };
            tag.last_value = value;
            let was = tag.alarm_active;
            tag.evaluate_alarm();
            if tag.alarm_active != was {
                debug!(
                    device = %self.device,
                    tag = %tag.cfg.name,
                    value,
                    active = tag.alarm_active,
                    "tag alarm transition"
                );
            }

            delta.push((
                AddressKey::input(i as u16),
                Value::Word(value.clamp(0.0, 65535.0) as u16),
            ));
            delta.push((AddressKey::coil(i as u16), Value::Bit(tag.alarm_active)));
        }
        if !delta.is_empty() {
            fabric.write_bulk(&self.device, &delta)?;
        }
        Ok(())
    }
}
