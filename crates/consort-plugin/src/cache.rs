//! Flat, sectioned text format for the plugin cache.
//!
//! ```text
//! [plugin]
//! id=4D6F6F47
//! path=/usr/lib/vst/moog.so
//! name=Moog
//! ...
//! flags=15
//! [parameters]
//! n=2
//! Cutoff,Hz,0
//! Resonance,,1
//! [programs]
//! n=1
//! Init
//! [keys]
//! n=2
//! Moog
//! /usr/lib/vst/moog.so
//! [exceptions]
//! n=1
//! /usr/lib/vst/broken.so
//! ```
//!
//! Values are escaped (`\\`, `\n`, `\r`, and `\,` inside comma-separated
//! lines) so names can contain any character. The same format is used by the
//! probe child to hand its result back to the parent.

use consort_core::descriptor::{
    ParamInfo, PluginDescriptor, PluginFlags, PluginFormat, PluginId, ShellEntry,
};
use consort_core::error::{HostError, Result};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of a cache file: every known plugin plus the denylist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheFile {
    pub plugins: Vec<PluginDescriptor>,
    pub exceptions: Vec<PathBuf>,
}

impl CacheFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::new(text);
        let mut file = CacheFile::default();
        while let Some(line) = reader.peek() {
            reader.advance();
            match line.trim() {
                "[plugin]" => file.plugins.push(read_plugin(&mut reader)?),
                "[exceptions]" => {
                    for raw in read_list(&mut reader)? {
                        file.exceptions.push(PathBuf::from(unescape(raw)));
                    }
                }
                other => return Err(reader.error(format!("unexpected line '{}'", other))),
            }
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let file = Self::parse(&text)?;
        tracing::debug!(
            "Read {} plugins and {} exceptions from {}",
            file.plugins.len(),
            file.exceptions.len(),
            path.display()
        );
        Ok(file)
    }

    /// Write the file atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_string().as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| HostError::Io(e.error))?;
        tracing::debug!("Wrote plugin cache {}", path.display());
        Ok(())
    }
}

impl fmt::Display for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for desc in &self.plugins {
            write_descriptor(f, desc)?;
        }
        if !self.exceptions.is_empty() {
            writeln!(f, "[exceptions]")?;
            writeln!(f, "n={}", self.exceptions.len())?;
            for path in &self.exceptions {
                writeln!(f, "{}", escape(&path.to_string_lossy(), false))?;
            }
        }
        Ok(())
    }
}

/// Serialize one descriptor as a `[plugin]` block.
pub fn descriptor_to_text(desc: &PluginDescriptor) -> String {
    DescriptorText(desc).to_string()
}

/// Parse text holding exactly one `[plugin]` block.
pub fn descriptor_from_text(text: &str) -> Result<PluginDescriptor> {
    let mut file = CacheFile::parse(text)?;
    match file.plugins.len() {
        1 => Ok(file.plugins.remove(0)),
        n => Err(HostError::Cache {
            line: 0,
            reason: format!("expected one plugin, found {}", n),
        }),
    }
}

struct DescriptorText<'a>(&'a PluginDescriptor);

impl fmt::Display for DescriptorText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_descriptor(f, self.0)
    }
}

fn write_descriptor(f: &mut impl fmt::Write, desc: &PluginDescriptor) -> fmt::Result {
    writeln!(f, "[plugin]")?;
    writeln!(f, "id={}", desc.id)?;
    writeln!(f, "path={}", escape(&desc.path.to_string_lossy(), false))?;
    writeln!(f, "name={}", escape(&desc.name, false))?;
    writeln!(f, "vendor={}", escape(&desc.vendor, false))?;
    writeln!(f, "category={}", escape(&desc.category, false))?;
    writeln!(f, "version={}", escape(&desc.version, false))?;
    writeln!(f, "sdkversion={}", escape(&desc.sdk_version, false))?;
    if let Some(format) = desc.format {
        writeln!(f, "format={}", format_tag(format))?;
    }
    writeln!(f, "inputs={}", desc.channels.inputs)?;
    writeln!(f, "outputs={}", desc.channels.outputs)?;
    writeln!(f, "auxinputs={}", desc.channels.aux_inputs)?;
    writeln!(f, "auxoutputs={}", desc.channels.aux_outputs)?;
    writeln!(f, "flags={:X}", desc.flags.bits())?;

    if !desc.parameters.is_empty() {
        writeln!(f, "[parameters]")?;
        writeln!(f, "n={}", desc.parameters.len())?;
        for p in &desc.parameters {
            writeln!(f, "{},{},{:X}", escape(&p.name, true), escape(&p.label, true), p.id)?;
        }
    }
    if !desc.programs.is_empty() {
        writeln!(f, "[programs]")?;
        writeln!(f, "n={}", desc.programs.len())?;
        for name in &desc.programs {
            writeln!(f, "{}", escape(name, false))?;
        }
    }
    if !desc.shell.is_empty() {
        writeln!(f, "[shell]")?;
        writeln!(f, "n={}", desc.shell.len())?;
        for entry in &desc.shell {
            writeln!(f, "{},{:X}", escape(&entry.name, true), entry.id)?;
        }
    }
    if !desc.keys.is_empty() {
        writeln!(f, "[keys]")?;
        writeln!(f, "n={}", desc.keys.len())?;
        for key in &desc.keys {
            writeln!(f, "{}", escape(key, false))?;
        }
    }
    Ok(())
}

fn format_tag(format: PluginFormat) -> &'static str {
    match format {
        PluginFormat::Vst2 => "vst2",
        PluginFormat::Vst3 => "vst3",
    }
}

fn read_plugin(reader: &mut Reader<'_>) -> Result<PluginDescriptor> {
    let mut desc = PluginDescriptor::default();

    while let Some(line) = reader.peek() {
        if line.starts_with('[') {
            break;
        }
        reader.advance();
        let Some((key, value)) = line.split_once('=') else {
            return Err(reader.error(format!("expected key=value, got '{}'", line)));
        };
        let value = unescape(value);
        match key.trim() {
            "id" => {
                desc.id = PluginId::parse(&value)
                    .ok_or_else(|| reader.error(format!("bad plugin id '{}'", value)))?
            }
            "path" => desc.path = PathBuf::from(value),
            "name" => desc.name = value,
            "vendor" => desc.vendor = value,
            "category" => desc.category = value,
            "version" => desc.version = value,
            "sdkversion" => desc.sdk_version = value,
            "format" => {
                desc.format = match value.trim() {
                    "vst2" => Some(PluginFormat::Vst2),
                    "vst3" => Some(PluginFormat::Vst3),
                    other => {
                        tracing::warn!("cache line {}: unknown format '{}'", reader.line(), other);
                        None
                    }
                }
            }
            "inputs" => desc.channels.inputs = reader.number(&value)?,
            "outputs" => desc.channels.outputs = reader.number(&value)?,
            "auxinputs" => desc.channels.aux_inputs = reader.number(&value)?,
            "auxoutputs" => desc.channels.aux_outputs = reader.number(&value)?,
            "flags" => {
                let bits = u32::from_str_radix(value.trim(), 16)
                    .map_err(|_| reader.error(format!("bad flags '{}'", value)))?;
                desc.flags = PluginFlags::from_bits(bits);
            }
            other => {
                tracing::warn!("cache line {}: unknown key '{}' ignored", reader.line(), other);
            }
        }
    }

    while let Some(line) = reader.peek() {
        match line.trim() {
            "[parameters]" => {
                reader.advance();
                for raw in read_list(reader)? {
                    let fields = split_fields(raw);
                    let [name, label, id] = fields.as_slice() else {
                        return Err(reader.error(format!("bad parameter line '{}'", raw)));
                    };
                    let id = u32::from_str_radix(id.trim(), 16)
                        .map_err(|_| reader.error(format!("bad parameter id '{}'", id)))?;
                    desc.add_param(ParamInfo::new(name.as_str(), label.as_str(), id));
                }
            }
            "[programs]" => {
                reader.advance();
                for raw in read_list(reader)? {
                    desc.programs.push(unescape(raw));
                }
            }
            "[shell]" => {
                reader.advance();
                for raw in read_list(reader)? {
                    let fields = split_fields(raw);
                    let [name, id] = fields.as_slice() else {
                        return Err(reader.error(format!("bad shell line '{}'", raw)));
                    };
                    let id = u32::from_str_radix(id.trim(), 16)
                        .map_err(|_| reader.error(format!("bad shell id '{}'", id)))?;
                    desc.shell.push(ShellEntry {
                        name: name.clone(),
                        id,
                    });
                }
            }
            "[keys]" => {
                reader.advance();
                for raw in read_list(reader)? {
                    desc.keys.push(unescape(raw));
                }
            }
            _ => break,
        }
    }

    if desc.name.is_empty() {
        return Err(reader.error("plugin block without a name".to_string()));
    }
    if desc.format.is_none() {
        desc.format = PluginFormat::from_path(&desc.path);
    }
    Ok(desc)
}

/// `n=<count>` followed by exactly `count` raw lines.
fn read_list<'a>(reader: &mut Reader<'a>) -> Result<Vec<&'a str>> {
    let Some(header) = reader.peek() else {
        return Err(reader.error("missing count line".to_string()));
    };
    reader.advance();
    let count = header
        .trim()
        .strip_prefix("n=")
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| reader.error(format!("expected n=<count>, got '{}'", header)))?;

    let mut lines = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        match reader.next_raw() {
            Some(line) => lines.push(line),
            None => return Err(reader.error(format!("section truncated, expected {} lines", count))),
        }
    }
    Ok(lines)
}

struct Reader<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().map(|l| l.trim_end_matches('\r')).collect(),
            pos: 0,
        }
    }

    /// Next meaningful line, skipping blanks and `#` comments.
    fn peek(&mut self) -> Option<&'a str> {
        while let Some(line) = self.lines.get(self.pos) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                self.pos += 1;
            } else {
                return Some(line);
            }
        }
        None
    }

    /// Next line verbatim (list entries may legitimately be empty).
    fn next_raw(&mut self) -> Option<&'a str> {
        let line = self.lines.get(self.pos).copied();
        if line.is_some() {
            self.pos += 1;
        }
        line
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    /// 1-based number of the line consumed last.
    fn line(&self) -> usize {
        self.pos
    }

    fn number(&self, value: &str) -> Result<usize> {
        value
            .trim()
            .parse()
            .map_err(|_| self.error(format!("bad number '{}'", value)))
    }

    fn error(&self, reason: String) -> HostError {
        HostError::Cache {
            line: self.line(),
            reason,
        }
    }
}

fn escape(s: &str, comma: bool) -> Cow<'_, str> {
    let needs = s
        .chars()
        .any(|c| matches!(c, '\\' | '\n' | '\r') || (comma && c == ','));
    if !needs {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ',' if comma => out.push_str("\\,"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split on unescaped commas, unescaping each field.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            fields.push(unescape(&current));
            current.clear();
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    fields.push(unescape(&current));
    fields
}
