// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kconfig = read_config()?;
    validate(&kconfig)?;
    generate_consts(&kconfig)?;
    Ok(())
}

/// Kernel configuration, as written in `kernel.toml`.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct KernelConfig {
    max_threads: usize,
    max_spaces: usize,
    max_mappings: usize,
    phys_frames: usize,
    page_shift: u8,
    superpage_shift: u8,
    tick_us: u64,
    default_quantum: u32,
    string_buffer_len: usize,
    sigma0_superpages: bool,
    root_priority: u8,
    root_entry: u32,
    root_stack: u32,
}

fn read_config() -> Result<KernelConfig, Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_CONFIG");
    let path = match env::var_os("KERN_CONFIG") {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").ok_or(
            "CARGO_MANIFEST_DIR not set; is this being run by cargo?",
        )?)
        .join("kernel.toml"),
    };
    println!("cargo:rerun-if-changed={}", path.display());

    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    let kconfig = toml::from_str(&text)
        .map_err(|e| format!("parsing {}: {e}", path.display()))?;
    Ok(kconfig)
}

fn validate(k: &KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    // These mirror the field widths in abi::ThreadId / abi::SpaceId.
    const THREAD_INDEX_LIMIT: usize = 1 << 10;
    const SPACE_INDEX_LIMIT: usize = 1 << 8;

    if k.max_threads == 0 || k.max_threads >= THREAD_INDEX_LIMIT {
        return Err(format!(
            "max-threads must be in 1..{THREAD_INDEX_LIMIT}, got {}",
            k.max_threads
        )
        .into());
    }
    if k.max_spaces == 0 || k.max_spaces > SPACE_INDEX_LIMIT {
        return Err(format!(
            "max-spaces must be in 1..={SPACE_INDEX_LIMIT}, got {}",
            k.max_spaces
        )
        .into());
    }
    if k.max_mappings == 0 || k.max_mappings > usize::from(u16::MAX) {
        return Err("max-mappings must fit a 16-bit handle index".into());
    }
    if !(12..=20).contains(&k.page_shift) {
        return Err(format!(
            "page-shift must be between 12 and 20, got {}",
            k.page_shift
        )
        .into());
    }
    if k.superpage_shift <= k.page_shift || k.superpage_shift > 31 {
        return Err(format!(
            "superpage-shift ({}) must be above page-shift ({}) and below 32",
            k.superpage_shift, k.page_shift
        )
        .into());
    }
    let frames_per_superpage = 1usize << (k.superpage_shift - k.page_shift);
    if k.phys_frames == 0 || k.phys_frames % frames_per_superpage != 0 {
        return Err(format!(
            "phys-frames ({}) must be a non-zero multiple of the frames per \
             superpage ({frames_per_superpage})",
            k.phys_frames
        )
        .into());
    }
    let phys_bytes = (k.phys_frames as u64) << k.page_shift;
    if phys_bytes > 1 << 32 {
        return Err("physical memory must fit a 32-bit address space".into());
    }
    if k.tick_us == 0 {
        return Err("tick-us must be non-zero".into());
    }
    if k.default_quantum == 0 {
        return Err("default-quantum must be non-zero".into());
    }
    if k.string_buffer_len == 0 {
        return Err("string-buffer-len must be non-zero".into());
    }
    Ok(())
}

fn generate_consts(k: &KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    let out = PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// Generated by build.rs from the kernel configuration.")?;
    writeln!(file)?;
    writeln!(file, "pub const MAX_THREADS: usize = {};", k.max_threads)?;
    writeln!(file, "pub const MAX_SPACES: usize = {};", k.max_spaces)?;
    writeln!(file, "pub const MAX_MAPPINGS: usize = {};", k.max_mappings)?;
    writeln!(file, "pub const PHYS_FRAMES: usize = {};", k.phys_frames)?;
    writeln!(file, "pub const PAGE_SHIFT: u8 = {};", k.page_shift)?;
    writeln!(file, "pub const SUPERPAGE_SHIFT: u8 = {};", k.superpage_shift)?;
    writeln!(file, "pub const TICK_US: u64 = {};", k.tick_us)?;
    writeln!(file, "pub const DEFAULT_QUANTUM: u32 = {};", k.default_quantum)?;
    writeln!(
        file,
        "pub const STRING_BUFFER_LEN: usize = {};",
        k.string_buffer_len
    )?;
    writeln!(
        file,
        "pub const SIGMA0_SUPERPAGES: bool = {};",
        k.sigma0_superpages
    )?;
    writeln!(
        file,
        "pub const ROOT_PRIORITY: abi::Priority = abi::Priority({});",
        k.root_priority
    )?;
    writeln!(file, "pub const ROOT_ENTRY: u32 = {:#010x};", k.root_entry)?;
    writeln!(file, "pub const ROOT_STACK: u32 = {:#010x};", k.root_stack)?;
    Ok(())
}
