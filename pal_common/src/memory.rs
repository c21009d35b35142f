//! The four-space memory map: coils, discrete inputs, holding registers,
//! input registers.
//!
//! Address spaces are typed arenas — value vectors indexed by `u16` with a
//! sparse presence bitmap per space. String keys (`"holding_registers[0]"`)
//! and named aliases are a boundary convenience; everything canonicalises to
//! `(space, index)` before it touches an arena.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Errors ─────────────────────────────────────────────────────────

/// Memory-map access error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Address is not mapped on this device.
    #[error("unmapped address: {key}")]
    Unmapped {
        /// Canonical key that missed.
        key: AddressKey,
    },

    /// Value shape does not match the address space (bit vs word).
    #[error("type mismatch at {key}: {space} holds {expected}")]
    TypeMismatch {
        /// Canonical key.
        key: AddressKey,
        /// Space name, for the diagnostic.
        space: AddressSpace,
        /// `"bits"` or `"words"`.
        expected: &'static str,
    },

    /// String key could not be parsed and is not a known alias.
    #[error("unknown key: {0}")]
    UnknownKey(String),
}

/// Result alias for memory-map operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

// ─── Address model ──────────────────────────────────────────────────

/// One of the four Modbus-style address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpace {
    /// Single-bit, writable by external clients and internal logic.
    Coils,
    /// Single-bit, read-only to external clients.
    DiscreteInputs,
    /// 16-bit, writable by external clients and internal logic.
    HoldingRegisters,
    /// 16-bit, read-only to external clients.
    InputRegisters,
}

impl AddressSpace {
    /// Whether this space holds single bits (vs 16-bit words).
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    /// Whether external clients may write this space.
    ///
    /// Telemetry spaces (discrete inputs, input registers) are written only
    /// by the owning device and its physics.
    pub const fn external_writable(self) -> bool {
        matches!(self, Self::Coils | Self::HoldingRegisters)
    }

    /// Canonical name used in string keys.
    pub const fn canonical(self) -> &'static str {
        match self {
            Self::Coils => "coils",
            Self::DiscreteInputs => "discrete_inputs",
            Self::HoldingRegisters => "holding_registers",
            Self::InputRegisters => "input_registers",
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

/// Canonical address: one space, one 16-bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey {
    /// Address space.
    pub space: AddressSpace,
    /// Index within the space.
    pub index: u16,
}

impl AddressKey {
    /// Shorthand constructor.
    pub const fn new(space: AddressSpace, index: u16) -> Self {
        Self { space, index }
    }

    /// `coils[i]`
    pub const fn coil(index: u16) -> Self {
        Self::new(AddressSpace::Coils, index)
    }

    /// `discrete_inputs[i]`
    pub const fn discrete(index: u16) -> Self {
        Self::new(AddressSpace::DiscreteInputs, index)
    }

    /// `holding_registers[i]`
    pub const fn holding(index: u16) -> Self {
        Self::new(AddressSpace::HoldingRegisters, index)
    }

    /// `input_registers[i]`
    pub const fn input(index: u16) -> Self {
        Self::new(AddressSpace::InputRegisters, index)
    }
}

impl fmt::Display for AddressKey {
    /// Canonical string form, e.g. `holding_registers[0]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.space.canonical(), self.index)
    }
}

impl FromStr for AddressKey {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MemoryError::UnknownKey(s.to_string());
        let open = s.find('[').ok_or_else(err)?;
        if !s.ends_with(']') {
            return Err(err());
        }
        let space = match &s[..open] {
            "coils" => AddressSpace::Coils,
            "discrete_inputs" => AddressSpace::DiscreteInputs,
            "holding_registers" => AddressSpace::HoldingRegisters,
            "input_registers" => AddressSpace::InputRegisters,
            _ => return Err(err()),
        };
        let index: u16 = s[open + 1..s.len() - 1].parse().map_err(|_| err())?;
        Ok(Self { space, index })
    }
}

/// A typed memory value: a bit or a 16-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Coil / discrete input value.
    Bit(bool),
    /// Holding / input register value.
    Word(u16),
}

impl Value {
    /// The contained bit, if any.
    pub const fn as_bit(self) -> Option<bool> {
        match self {
            Self::Bit(b) => Some(b),
            Self::Word(_) => None,
        }
    }

    /// The contained word, if any.
    pub const fn as_word(self) -> Option<u16> {
        match self {
            Self::Word(w) => Some(w),
            Self::Bit(_) => None,
        }
    }
}

// ─── Presence bitmap ────────────────────────────────────────────────

/// Sparse presence bitmap over `u16` indices, packed into 64-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceMask {
    words: Vec<u64>,
}

impl PresenceMask {
    /// Whether `index` is marked present.
    #[inline]
    pub fn contains(&self, index: u16) -> bool {
        let (w, b) = (index as usize / 64, index as usize % 64);
        self.words.get(w).is_some_and(|word| word & (1 << b) != 0)
    }

    /// Mark `index` present.
    pub fn insert(&mut self, index: u16) {
        let (w, b) = (index as usize / 64, index as usize % 64);
        if self.words.len() <= w {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << b;
    }

    /// Number of present indices.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate present indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64)
                .filter(move |b| word & (1u64 << b) != 0)
                .map(move |b| (w * 64 + b) as u16)
        })
    }
}

// ─── Typed arenas ───────────────────────────────────────────────────

/// Bit arena: value vector + presence bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitArena {
    present: PresenceMask,
    values: Vec<bool>,
}

impl BitArena {
    /// Map `index`, initialising to `initial`. Remapping overwrites the value.
    pub fn map(&mut self, index: u16, initial: bool) {
        self.present.insert(index);
        if self.values.len() <= index as usize {
            self.values.resize(index as usize + 1, false);
        }
        self.values[index as usize] = initial;
    }

    /// Read a mapped bit.
    #[inline]
    pub fn get(&self, index: u16) -> Option<bool> {
        self.present
            .contains(index)
            .then(|| self.values[index as usize])
    }

    /// Write a mapped bit. `false` return means unmapped.
    #[inline]
    pub fn set(&mut self, index: u16, value: bool) -> bool {
        if !self.present.contains(index) {
            return false;
        }
        self.values[index as usize] = value;
        true
    }

    /// Presence bitmap.
    pub fn present(&self) -> &PresenceMask {
        &self.present
    }
}

/// Word arena: value vector + presence bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordArena {
    present: PresenceMask,
    values: Vec<u16>,
}

impl WordArena {
    /// Map `index`, initialising to `initial`. Remapping overwrites the value.
    pub fn map(&mut self, index: u16, initial: u16) {
        self.present.insert(index);
        if self.values.len() <= index as usize {
            self.values.resize(index as usize + 1, 0);
        }
        self.values[index as usize] = initial;
    }

    /// Read a mapped word.
    #[inline]
    pub fn get(&self, index: u16) -> Option<u16> {
        self.present
            .contains(index)
            .then(|| self.values[index as usize])
    }

    /// Write a mapped word. `false` return means unmapped.
    #[inline]
    pub fn set(&mut self, index: u16, value: u16) -> bool {
        if !self.present.contains(index) {
            return false;
        }
        self.values[index as usize] = value;
        true
    }

    /// Presence bitmap.
    pub fn present(&self) -> &PresenceMask {
        &self.present
    }
}

// ─── Memory map ─────────────────────────────────────────────────────

/// A partial update applied atomically per device.
pub type MapDelta = Vec<(AddressKey, Value)>;

/// The union of the four address spaces for one device, plus its alias table.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    coils: BitArena,
    discrete_inputs: BitArena,
    holding_registers: WordArena,
    input_registers: WordArena,
    aliases: HashMap<String, AddressKey>,
}

impl MemoryMap {
    /// Empty map with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a bit address (coil or discrete input) with an initial value.
    pub fn map_bit(&mut self, key: AddressKey, initial: bool) {
        debug_assert!(key.space.is_bit());
        match key.space {
            AddressSpace::Coils => self.coils.map(key.index, initial),
            AddressSpace::DiscreteInputs => self.discrete_inputs.map(key.index, initial),
            _ => {}
        }
    }

    /// Map a word address (holding or input register) with an initial value.
    pub fn map_word(&mut self, key: AddressKey, initial: u16) {
        debug_assert!(!key.space.is_bit());
        match key.space {
            AddressSpace::HoldingRegisters => self.holding_registers.map(key.index, initial),
            AddressSpace::InputRegisters => self.input_registers.map(key.index, initial),
            _ => {}
        }
    }

    /// Register a named alias for a canonical key.
    pub fn alias(&mut self, name: impl Into<String>, key: AddressKey) {
        self.aliases.insert(name.into(), key);
    }

    /// Resolve a string key — alias first, then canonical form.
    pub fn resolve(&self, key: &str) -> MemoryResult<AddressKey> {
        if let Some(k) = self.aliases.get(key) {
            return Ok(*k);
        }
        key.parse()
    }

    /// Read one address. `None` means unmapped.
    pub fn read(&self, key: AddressKey) -> Option<Value> {
        match key.space {
            AddressSpace::Coils => self.coils.get(key.index).map(Value::Bit),
            AddressSpace::DiscreteInputs => self.discrete_inputs.get(key.index).map(Value::Bit),
            AddressSpace::HoldingRegisters => self.holding_registers.get(key.index).map(Value::Word),
            AddressSpace::InputRegisters => self.input_registers.get(key.index).map(Value::Word),
        }
    }

    /// Write one address with type checking.
    pub fn write(&mut self, key: AddressKey, value: Value) -> MemoryResult<()> {
        let ok = match (key.space, value) {
            (AddressSpace::Coils, Value::Bit(b)) => self.coils.set(key.index, b),
            (AddressSpace::DiscreteInputs, Value::Bit(b)) => self.discrete_inputs.set(key.index, b),
            (AddressSpace::HoldingRegisters, Value::Word(w)) => {
                self.holding_registers.set(key.index, w)
            }
            (AddressSpace::InputRegisters, Value::Word(w)) => self.input_registers.set(key.index, w),
            (space, _) => {
                return Err(MemoryError::TypeMismatch {
                    key,
                    space,
                    expected: if space.is_bit() { "bits" } else { "words" },
                });
            }
        };
        if ok {
            Ok(())
        } else {
            Err(MemoryError::Unmapped { key })
        }
    }

    /// Apply a delta atomically: every entry is validated (mapped, right
    /// type) before any value changes. On error the map is untouched.
    pub fn apply(&mut self, delta: &MapDelta) -> MemoryResult<()> {
        for (key, value) in delta {
            if self.read(*key).is_none() {
                return Err(MemoryError::Unmapped { key: *key });
            }
            let shape_ok = key.space.is_bit() == matches!(value, Value::Bit(_));
            if !shape_ok {
                return Err(MemoryError::TypeMismatch {
                    key: *key,
                    space: key.space,
                    expected: if key.space.is_bit() { "bits" } else { "words" },
                });
            }
        }
        for (key, value) in delta {
            // Validated above; cannot fail.
            let _ = self.write(*key, *value);
        }
        Ok(())
    }

    /// Clone the current state into an immutable snapshot.
    pub fn snapshot(&self) -> MemoryMapSnapshot {
        MemoryMapSnapshot {
            coils: self.coils.clone(),
            discrete_inputs: self.discrete_inputs.clone(),
            holding_registers: self.holding_registers.clone(),
            input_registers: self.input_registers.clone(),
        }
    }
}

/// Immutable copy of the four arenas, taken under the device lock.
///
/// Snapshots are what scan machines read, what mirrors serve from, and what
/// determinism tests compare (`PartialEq`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMapSnapshot {
    coils: BitArena,
    discrete_inputs: BitArena,
    holding_registers: WordArena,
    input_registers: WordArena,
}

impl MemoryMapSnapshot {
    /// Read one address. `None` means unmapped.
    pub fn read(&self, key: AddressKey) -> Option<Value> {
        match key.space {
            AddressSpace::Coils => self.coils.get(key.index).map(Value::Bit),
            AddressSpace::DiscreteInputs => self.discrete_inputs.get(key.index).map(Value::Bit),
            AddressSpace::HoldingRegisters => self.holding_registers.get(key.index).map(Value::Word),
            AddressSpace::InputRegisters => self.input_registers.get(key.index).map(Value::Word),
        }
    }

    /// Read a contiguous bit range; `None` when any index is unmapped.
    pub fn read_bits(&self, space: AddressSpace, start: u16, count: u16) -> Option<Vec<bool>> {
        let arena = match space {
            AddressSpace::Coils => &self.coils,
            AddressSpace::DiscreteInputs => &self.discrete_inputs,
            _ => return None,
        };
        (0..count)
            .map(|i| start.checked_add(i).and_then(|idx| arena.get(idx)))
            .collect()
    }

    /// Read a contiguous word range; `None` when any index is unmapped.
    pub fn read_words(&self, space: AddressSpace, start: u16, count: u16) -> Option<Vec<u16>> {
        let arena = match space {
            AddressSpace::HoldingRegisters => &self.holding_registers,
            AddressSpace::InputRegisters => &self.input_registers,
            _ => return None,
        };
        (0..count)
            .map(|i| start.checked_add(i).and_then(|idx| arena.get(idx)))
            .collect()
    }

    /// Whether a single address is mapped.
    pub fn is_mapped(&self, key: AddressKey) -> bool {
        self.read(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> MemoryMap {
        let mut m = MemoryMap::new();
        m.map_word(AddressKey::holding(0), 0);
        m.map_word(AddressKey::input(0), 0);
        m.map_bit(AddressKey::coil(10), false);
        m.map_bit(AddressKey::discrete(0), false);
        m.alias("speed_setpoint_rpm", AddressKey::holding(0));
        m
    }

    #[test]
    fn canonical_key_round_trip() {
        let key: AddressKey = "holding_registers[42]".parse().unwrap();
        assert_eq!(key, AddressKey::holding(42));
        assert_eq!(key.to_string(), "holding_registers[42]");

        assert!("holding_registers[99999]".parse::<AddressKey>().is_err());
        assert!("registers[0]".parse::<AddressKey>().is_err());
        assert!("coils[".parse::<AddressKey>().is_err());
    }

    #[test]
    fn alias_resolves_to_canonical() {
        let m = sample_map();
        assert_eq!(
            m.resolve("speed_setpoint_rpm").unwrap(),
            AddressKey::holding(0)
        );
        assert_eq!(m.resolve("coils[10]").unwrap(), AddressKey::coil(10));
        assert!(matches!(
            m.resolve("nope"),
            Err(MemoryError::UnknownKey(_))
        ));
    }

    #[test]
    fn typed_writes_are_checked() {
        let mut m = sample_map();
        m.write(AddressKey::holding(0), Value::Word(3600)).unwrap();
        assert_eq!(m.read(AddressKey::holding(0)), Some(Value::Word(3600)));

        let err = m.write(AddressKey::holding(0), Value::Bit(true)).unwrap_err();
        assert!(matches!(err, MemoryError::TypeMismatch { .. }));

        let err = m.write(AddressKey::holding(7), Value::Word(1)).unwrap_err();
        assert!(matches!(err, MemoryError::Unmapped { .. }));
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let mut m = sample_map();
        let delta = vec![
            (AddressKey::holding(0), Value::Word(100)),
            (AddressKey::holding(99), Value::Word(1)), // unmapped — must abort everything
        ];
        assert!(m.apply(&delta).is_err());
        assert_eq!(m.read(AddressKey::holding(0)), Some(Value::Word(0)));

        let delta = vec![
            (AddressKey::holding(0), Value::Word(100)),
            (AddressKey::coil(10), Value::Bit(true)),
        ];
        m.apply(&delta).unwrap();
        assert_eq!(m.read(AddressKey::holding(0)), Some(Value::Word(100)));
        assert_eq!(m.read(AddressKey::coil(10)), Some(Value::Bit(true)));
    }

    #[test]
    fn snapshot_range_reads() {
        let mut m = MemoryMap::new();
        for i in 0..16 {
            m.map_word(AddressKey::holding(i), i * 10);
        }
        let snap = m.snapshot();
        let words = snap
            .read_words(AddressSpace::HoldingRegisters, 0, 16)
            .unwrap();
        assert_eq!(words[3], 30);
        // Straddling the mapped range fails as a whole.
        assert!(snap.read_words(AddressSpace::HoldingRegisters, 10, 10).is_none());
        assert!(snap.read_words(AddressSpace::HoldingRegisters, 9999, 1).is_none());
    }

    #[test]
    fn presence_mask_iterates_sorted() {
        let mut mask = PresenceMask::default();
        mask.insert(130);
        mask.insert(2);
        mask.insert(63);
        mask.insert(64);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![2, 63, 64, 130]);
        assert_eq!(mask.len(), 4);
        assert!(mask.contains(64));
        assert!(!mask.contains(65));
    }
}
