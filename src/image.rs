//! Ambient: the target-image loading collaborator.
//!
//! Per spec.md §1 this is explicitly out of scope for the core — "the host
//! process maps the target as a library" is a statement about the
//! *environment*, not an algorithm the devirtualizer implements. What
//! follows is the thinnest adapter that lets the CLI binary hand the core a
//! [`crate::decode::MemoryReader`]; none of `decode`/`routine`/`vmstate`/
//! `keys`/`matcher`/`driver` depend on this module.

use std::path::Path;

use crate::decode::MemoryReader;
use crate::error::Result;

/// A mapped target image: something that can serve raw bytes at an
/// absolute address and knows where it was based.
pub trait TargetImage: MemoryReader {
    fn base_address(&self) -> u64;
}

/// Loads the target as a library without running its initializers, mirroring
/// the original tool's `LoadLibraryExA(path, NULL, DONT_RESOLVE_DLL_REFERENCES)`.
/// The returned module base is the image's base address; addresses handed
/// to [`MemoryReader::read`] are absolute process addresses, read directly
/// out of the mapped pages.
#[cfg(windows)]
pub struct ProcessImage {
    library: libloading::os::windows::Library,
    base_address: u64,
}

#[cfg(windows)]
impl ProcessImage {
    pub fn load(path: &Path) -> Result<Self> {
        use libloading::os::windows::{Library, DONT_RESOLVE_DLL_REFERENCES};

        let library = unsafe { Library::load_with_flags(path, DONT_RESOLVE_DLL_REFERENCES)? };
        let base_address = library.into_raw() as u64;
        // SAFETY: `into_raw` consumed the handle above; reconstruct a
        // `Library` from the same raw value so its `Drop` still frees it.
        let library = unsafe { Library::from_raw(base_address as *mut _) };
        Ok(ProcessImage { library, base_address })
    }
}

#[cfg(windows)]
impl TargetImage for ProcessImage {
    fn base_address(&self) -> u64 {
        self.base_address
    }
}

#[cfg(windows)]
impl MemoryReader for ProcessImage {
    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        if address == 0 {
            return Vec::new();
        }
        // SAFETY: the resource model (spec.md §5) requires pages reached
        // by the driver to be readable and mapped for its lifetime; this
        // trusts that invariant exactly as the original tool's direct
        // pointer dereference did.
        unsafe { std::slice::from_raw_parts(address as *const u8, len).to_vec() }
    }
}

#[cfg(windows)]
unsafe impl Send for ProcessImage {}
#[cfg(windows)]
unsafe impl Sync for ProcessImage {}

/// Portable fallback: loads the whole file into memory and treats
/// [`MemoryReader::read`] addresses as byte offsets into it. This is the
/// path used off-Windows and in tests — it can't emulate ASLR-relative
/// mapping, so it's only suitable for targets whose tuning constants
/// (`TargetConfig`) are expressed as file offsets rather than runtime
/// virtual addresses.
pub struct FileImage {
    bytes: Vec<u8>,
}

impl FileImage {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(FileImage { bytes: std::fs::read(path)? })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl TargetImage for FileImage {
    fn base_address(&self) -> u64 {
        0
    }
}

impl MemoryReader for FileImage {
    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let start = address as usize;
        if start >= self.bytes.len() {
            return Vec::new();
        }
        let end = (start + len).min(self.bytes.len());
        self.bytes[start..end].to_vec()
    }
}
