//! CPU architecture detection for plugin binaries.
//!
//! Loading a module built for another architecture can take the whole
//! process down on some platforms, so the header is inspected first: ELF on
//! Linux, Mach-O (thin or fat) on macOS and PE/COFF on Windows.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use consort_core::error::{HostError, LoadStage, Result};
use smallvec::SmallVec;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
    PowerPc,
    PowerPc64,
    Unknown(u32),
}

/// Architectures contained in one binary (fat Mach-O files carry several).
pub type ArchList = SmallVec<[Arch; 4]>;

impl Arch {
    /// Architecture this process was compiled for.
    pub fn host() -> Arch {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "arm") {
            Arch::Arm
        } else if cfg!(target_arch = "powerpc64") {
            Arch::PowerPc64
        } else if cfg!(target_arch = "powerpc") {
            Arch::PowerPc
        } else {
            Arch::Unknown(0)
        }
    }

    fn from_elf_machine(machine: u16) -> Arch {
        match machine {
            3 => Arch::X86,
            62 => Arch::X86_64,
            40 => Arch::Arm,
            183 => Arch::Aarch64,
            20 => Arch::PowerPc,
            21 => Arch::PowerPc64,
            other => Arch::Unknown(other as u32),
        }
    }

    fn from_macho_cputype(cputype: u32) -> Arch {
        const ABI64: u32 = 0x0100_0000;
        match cputype {
            7 => Arch::X86,
            t if t == 7 | ABI64 => Arch::X86_64,
            12 => Arch::Arm,
            t if t == 12 | ABI64 => Arch::Aarch64,
            18 => Arch::PowerPc,
            t if t == 18 | ABI64 => Arch::PowerPc64,
            other => Arch::Unknown(other),
        }
    }

    fn from_pe_machine(machine: u16) -> Arch {
        match machine {
            0x014C => Arch::X86,
            0x8664 => Arch::X86_64,
            0x01C0 | 0x01C4 => Arch::Arm,
            0xAA64 => Arch::Aarch64,
            0x01F0 => Arch::PowerPc,
            other => Arch::Unknown(other as u32),
        }
    }

    /// Directory name used for this architecture inside a VST3 bundle.
    pub fn bundle_dir(&self) -> Option<&'static str> {
        let windows = cfg!(windows);
        let name = match (self, windows) {
            (Arch::X86_64, false) => "x86_64-linux",
            (Arch::X86_64, true) => "x86_64-win",
            (Arch::X86, false) => "i386-linux",
            (Arch::X86, true) => "x86-win",
            (Arch::Aarch64, false) => "aarch64-linux",
            (Arch::Aarch64, true) => "arm64-win",
            (Arch::Arm, false) => "armv7l-linux",
            (Arch::Arm, true) => "arm-win",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86 => write!(f, "i386"),
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Arm => write!(f, "arm"),
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::PowerPc => write!(f, "ppc"),
            Arch::PowerPc64 => write!(f, "ppc64"),
            Arch::Unknown(code) => write!(f, "unknown (0x{:X})", code),
        }
    }
}

/// Resolve a module path to the binary that actually gets loaded.
///
/// Plain files resolve to themselves. Bundles resolve to
/// `Contents/MacOS/<name>` or `Contents/<arch>-<os>/<name>.<ext>`, preferring
/// the host architecture's directory.
pub fn resolve_binary(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }
    let contents = path.join("Contents");
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let macos = contents.join("MacOS");
    if macos.is_dir() {
        let candidate = macos.join(&stem);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if let Some(first) = first_file(&macos, None) {
            return Ok(first);
        }
    }

    let mut arch_dirs: Vec<PathBuf> = fs::read_dir(&contents)
        .map_err(|e| {
            HostError::load_failed(path, LoadStage::Scanning, format!("not a plugin bundle: {}", e))
        })?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .filter(|p| !matches!(p.file_name().and_then(|n| n.to_str()), Some("Resources" | "MacOS")))
        .collect();
    // host directory first, then the rest so a foreign-only bundle
    // still resolves and fails the architecture check with a clear error
    let host_dir = Arch::host().bundle_dir();
    arch_dirs.sort_by_key(|p| p.file_name().and_then(|n| n.to_str()) != host_dir);

    for dir in &arch_dirs {
        if let Some(binary) = first_file(dir, Some(&stem)) {
            return Ok(binary);
        }
    }
    Err(HostError::load_failed(
        path,
        LoadStage::Scanning,
        "no binary found inside bundle",
    ))
}

fn first_file(dir: &Path, prefer_stem: Option<&str>) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    if let Some(stem) = prefer_stem {
        if let Some(exact) = files
            .iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(stem))
        {
            return Some(exact.clone());
        }
    }
    files.into_iter().next()
}

/// Read the architectures a binary was built for from its header.
pub fn binary_archs(path: &Path) -> Result<ArchList> {
    let invalid = |reason: &str| HostError::load_failed(path, LoadStage::Validating, reason);

    let mut file = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| invalid("file too small to be a binary module"))?;

    let archs = match magic {
        [0x7F, b'E', b'L', b'F'] => read_elf(&mut file),
        [b'M', b'Z', _, _] => read_pe(&mut file),
        [0xCA, 0xFE, 0xBA, 0xBE] => read_fat(&mut file, false),
        [0xCA, 0xFE, 0xBA, 0xBF] => read_fat(&mut file, true),
        [0xFE, 0xED, 0xFA, 0xCE] | [0xFE, 0xED, 0xFA, 0xCF] => {
            file.read_u32::<BigEndian>().map(|t| smallvec::smallvec![Arch::from_macho_cputype(t)])
        }
        [0xCE, 0xFA, 0xED, 0xFE] | [0xCF, 0xFA, 0xED, 0xFE] => {
            file.read_u32::<LittleEndian>().map(|t| smallvec::smallvec![Arch::from_macho_cputype(t)])
        }
        _ => return Err(invalid("not a recognized executable format")),
    };

    match archs {
        Ok(archs) if !archs.is_empty() => Ok(archs),
        Ok(_) => Err(invalid("binary declares no architectures")),
        Err(_) => Err(invalid("truncated executable header")),
    }
}

fn read_elf<R: Read + Seek>(file: &mut R) -> std::io::Result<ArchList> {
    // e_ident[EI_DATA] at byte 5: 1 = little endian, 2 = big endian
    file.seek(SeekFrom::Start(5))?;
    let data = file.read_u8()?;
    file.seek(SeekFrom::Start(18))?;
    let machine = if data == 2 {
        file.read_u16::<BigEndian>()?
    } else {
        file.read_u16::<LittleEndian>()?
    };
    Ok(smallvec::smallvec![Arch::from_elf_machine(machine)])
}

fn read_pe<R: Read + Seek>(file: &mut R) -> std::io::Result<ArchList> {
    file.seek(SeekFrom::Start(0x3C))?;
    let pe_offset = file.read_u32::<LittleEndian>()?;
    file.seek(SeekFrom::Start(pe_offset as u64))?;
    let mut signature = [0u8; 4];
    file.read_exact(&mut signature)?;
    if &signature != b"PE\0\0" {
        return Ok(ArchList::new());
    }
    let machine = file.read_u16::<LittleEndian>()?;
    Ok(smallvec::smallvec![Arch::from_pe_machine(machine)])
}

fn read_fat<R: Read + Seek>(file: &mut R, wide: bool) -> std::io::Result<ArchList> {
    let count = file.read_u32::<BigEndian>()?;
    // Java class files share the 0xCAFEBABE magic; a real fat header has few slices
    if count == 0 || count > 32 {
        return Ok(ArchList::new());
    }
    let entry_size: i64 = if wide { 32 } else { 20 };
    let mut archs = ArchList::new();
    for _ in 0..count {
        let cputype = file.read_u32::<BigEndian>()?;
        archs.push(Arch::from_macho_cputype(cputype));
        file.seek(SeekFrom::Current(entry_size - 4))?;
    }
    Ok(archs)
}

/// Resolve `path` and make sure its binary can be loaded by this process.
///
/// Returns the binary path on success.
pub fn check_architecture(path: &Path) -> Result<PathBuf> {
    let binary = resolve_binary(path)?;
    let archs = binary_archs(&binary)?;
    let host = Arch::host();
    if archs.contains(&host) {
        return Ok(binary);
    }
    let found = archs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("/");
    Err(HostError::WrongArchitecture {
        path: path.to_path_buf(),
        found,
        expected: host.to_string(),
    })
}
