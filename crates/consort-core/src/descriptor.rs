//! Static plugin metadata.
//!
//! A [`PluginDescriptor`] is created once by the probe engine and then shared
//! read-only (via `Arc`) by the registry and every session that opens it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Binary plugin format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginFormat {
    Vst2,
    Vst3,
}

impl PluginFormat {
    /// Guess the format from a module path.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vst3" => Some(PluginFormat::Vst3),
            "dll" | "so" | "vst" => Some(PluginFormat::Vst2),
            _ => None,
        }
    }

    /// Registry key suffix used to keep the two formats apart.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            PluginFormat::Vst2 => "",
            PluginFormat::Vst3 => ".vst3",
        }
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginFormat::Vst2 => write!(f, "VST2"),
            PluginFormat::Vst3 => write!(f, "VST3"),
        }
    }
}

/// Unique plugin identifier: a 32-bit code (VST2, shell sub-plugins) or a 16-byte class ID (VST3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginId {
    Int(u32),
    Uid([u8; 16]),
}

impl Default for PluginId {
    fn default() -> Self {
        PluginId::Int(0)
    }
}

impl PluginId {
    /// Parse the textual form written by [`fmt::Display`]: 8 hex digits for `Int`,
    /// 32 for `Uid`. Plain decimal is accepted for `Int`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut uid = [0u8; 16];
            for (i, byte) in uid.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
            }
            return Some(PluginId::Uid(uid));
        }
        if let Some(hex) = s.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16).ok().map(PluginId::Int);
        }
        if s.len() == 8 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return u32::from_str_radix(s, 16).ok().map(PluginId::Int);
        }
        s.parse::<u32>().ok().map(PluginId::Int)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginId::Int(id) => write!(f, "{:08X}", id),
            PluginId::Uid(uid) => {
                for b in uid {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Capability bits of a plugin, persisted as a hex number in the cache file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PluginFlags(u32);

impl PluginFlags {
    pub const HAS_EDITOR: u32 = 1 << 0;
    pub const SYNTH: u32 = 1 << 1;
    pub const SINGLE_PRECISION: u32 = 1 << 2;
    pub const DOUBLE_PRECISION: u32 = 1 << 3;
    pub const MIDI_INPUT: u32 = 1 << 4;
    pub const MIDI_OUTPUT: u32 = 1 << 5;
    pub const SYSEX_INPUT: u32 = 1 << 6;
    pub const SYSEX_OUTPUT: u32 = 1 << 7;
    pub const BYPASS: u32 = 1 << 8;
    pub const SAMPLE_ACCURATE: u32 = 1 << 9;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u32, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// One plugin parameter as reported by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    /// Unit label ("dB", "Hz", ...).
    pub label: String,
    /// Format-native parameter ID (VST3 ParamID, VST2 index).
    pub id: u32,
}

impl ParamInfo {
    pub fn new(name: impl Into<String>, label: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            id,
        }
    }
}

/// One sub-plugin inside a shell module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellEntry {
    pub name: String,
    pub id: u32,
}

/// Channel layout of the main and auxiliary busses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelLayout {
    pub inputs: usize,
    pub outputs: usize,
    pub aux_inputs: usize,
    pub aux_outputs: usize,
}

impl ChannelLayout {
    pub fn stereo() -> Self {
        Self {
            inputs: 2,
            outputs: 2,
            aux_inputs: 0,
            aux_outputs: 0,
        }
    }
}

/// Immutable metadata describing one plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub path: PathBuf,
    pub name: String,
    pub vendor: String,
    pub category: String,
    pub version: String,
    pub sdk_version: String,
    pub format: Option<PluginFormat>,
    pub channels: ChannelLayout,
    pub flags: PluginFlags,
    pub parameters: Vec<ParamInfo>,
    pub programs: Vec<String>,
    /// Sub-plugins of a shell module (empty for ordinary plugins).
    pub shell: Vec<ShellEntry>,
    /// Extra lookup keys recorded by the registry.
    pub keys: Vec<String>,
    param_lookup: HashMap<String, usize>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            format: PluginFormat::from_path(&path),
            name: name.into(),
            path,
            channels: ChannelLayout::stereo(),
            flags: PluginFlags::from_bits(PluginFlags::SINGLE_PRECISION),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: PluginId) -> Self {
        self.id = id;
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn sdk_version(mut self, sdk_version: impl Into<String>) -> Self {
        self.sdk_version = sdk_version.into();
        self
    }

    pub fn format(mut self, format: PluginFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn channels(mut self, inputs: usize, outputs: usize) -> Self {
        self.channels.inputs = inputs;
        self.channels.outputs = outputs;
        self
    }

    pub fn aux_channels(mut self, aux_inputs: usize, aux_outputs: usize) -> Self {
        self.channels.aux_inputs = aux_inputs;
        self.channels.aux_outputs = aux_outputs;
        self
    }

    pub fn flag(mut self, flag: u32, on: bool) -> Self {
        self.flags.set(flag, on);
        self
    }

    pub fn param(mut self, info: ParamInfo) -> Self {
        self.add_param(info);
        self
    }

    pub fn program(mut self, name: impl Into<String>) -> Self {
        self.programs.push(name.into());
        self
    }

    pub fn shell_entry(mut self, name: impl Into<String>, id: u32) -> Self {
        self.shell.push(ShellEntry {
            name: name.into(),
            id,
        });
        self
    }

    pub fn add_param(&mut self, info: ParamInfo) {
        // first parameter with a given name wins
        self.param_lookup
            .entry(info.name.clone())
            .or_insert(self.parameters.len());
        self.parameters.push(info);
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    /// Parameter index by name.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_lookup.get(name).copied()
    }

    pub fn is_shell(&self) -> bool {
        !self.shell.is_empty()
    }

    pub fn has_editor(&self) -> bool {
        self.flags.contains(PluginFlags::HAS_EDITOR)
    }

    pub fn is_synth(&self) -> bool {
        self.flags.contains(PluginFlags::SYNTH)
    }

    pub fn single_precision(&self) -> bool {
        self.flags.contains(PluginFlags::SINGLE_PRECISION)
    }

    pub fn double_precision(&self) -> bool {
        self.flags.contains(PluginFlags::DOUBLE_PRECISION)
    }

    /// Primary registry key: the plugin name, suffixed for VST3.
    pub fn key(&self) -> String {
        let suffix = self.format.map(|f| f.key_suffix()).unwrap_or("");
        format!("{}{}", self.name, suffix)
    }
}
