//! Virtual memory reconstruction layer.
//!
//! The cache's address space is stitched together from mappings spread over
//! many backing files. [`Vm`] is a range map from cache virtual addresses to
//! `(file, file offset)` pairs; lookups locate the containing half-open
//! range in O(log n) without allocating. [`VmReader`] layers a cursor,
//! endianness and an address size on top for structured parsing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{FilePool, LazyFile, PostAllocFn, SessionId};
use crate::util::{is_aligned, memchr_null};

/// Byte order of multi-byte reads through a [`VmReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    /// Little-endian (the cache's native order)
    Little,
    /// Big-endian (only reachable through byte-swapped Mach-O magic)
    Big,
}

/// Half-open `[start, end)` address range.
///
/// Ordered by start address; ranges in the map are pairwise disjoint, so a
/// lookup probes for the greatest range starting at or below an address and
/// checks containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AddressRange {
    start: u64,
    end: u64,
}

/// A page-range entry: which file backs the range, and where.
#[derive(Debug, Clone)]
pub struct PageMapping {
    /// Lazy handle to the backing file
    pub file: Arc<LazyFile>,
    /// File offset corresponding to the range start
    pub file_offset: u64,
}

// =============================================================================
// VM
// =============================================================================

/// The page-range index over all backing cache files.
#[derive(Debug)]
pub struct Vm {
    map: BTreeMap<AddressRange, PageMapping>,
    page_size: u64,
    pool: Arc<FilePool>,
    session: SessionId,
}

impl Vm {
    /// Creates an empty VM with the given page size.
    pub fn new(pool: Arc<FilePool>, session: SessionId, page_size: u64) -> Self {
        Self {
            map: BTreeMap::new(),
            page_size,
            pool,
            session,
        }
    }

    /// Returns the page size this VM validates mappings against.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Inserts a page-aligned mapping backed by `path`.
    ///
    /// `post_alloc` is forwarded to the file pool and runs on every physical
    /// (re)mapping of the file before readers can observe it.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps an existing mapping. Backing cache
    /// mappings are pairwise disjoint by construction, so a collision is a
    /// caller bug, not an input condition.
    pub fn map_pages(
        &mut self,
        address: u64,
        file_offset: u64,
        size: u64,
        path: impl AsRef<Path>,
        post_alloc: Option<PostAllocFn>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if !is_aligned(address, self.page_size) || !is_aligned(size, self.page_size) {
            return Err(Error::MappingPageAlignment {
                address,
                size,
                page_size: self.page_size,
            });
        }

        let range = AddressRange {
            start: address,
            end: address + size,
        };
        let probe = AddressRange {
            start: range.end - 1,
            end: u64::MAX,
        };
        if let Some((existing, _)) = self.map.range(..=probe).next_back() {
            if existing.end > range.start {
                panic!(
                    "page mapping collision: [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                    range.start, range.end, existing.start, existing.end
                );
            }
        }

        let file = self.pool.open(self.session, path, post_alloc)?;
        self.map.insert(range, PageMapping { file, file_offset });
        Ok(())
    }

    #[inline]
    fn lookup(&self, addr: u64) -> Option<(&AddressRange, &PageMapping)> {
        let probe = AddressRange {
            start: addr,
            end: u64::MAX,
        };
        let (range, mapping) = self.map.range(..=probe).next_back()?;
        (range.start <= addr && addr < range.end).then_some((range, mapping))
    }

    /// Returns true when `addr` falls inside a mapped range.
    pub fn address_is_mapped(&self, addr: u64) -> bool {
        self.lookup(addr).is_some()
    }

    /// Returns the mapping containing `addr` and the offset of `addr`
    /// within the range.
    pub fn mapping_at(&self, addr: u64) -> Result<(&PageMapping, u64)> {
        let (range, mapping) = self
            .lookup(addr)
            .ok_or(Error::MappingRead { addr })?;
        Ok((mapping, addr - range.start))
    }

    /// Resolves `addr` to its backing file offset, checking that `length`
    /// bytes stay inside the containing range.
    fn resolve(&self, addr: u64, length: u64) -> Result<(&PageMapping, u64)> {
        let (range, mapping) = self
            .lookup(addr)
            .ok_or(Error::MappingRead { addr })?;
        if addr + length > range.end {
            return Err(Error::MappingRead { addr });
        }
        Ok((mapping, mapping.file_offset + (addr - range.start)))
    }

    /// Reads a byte.
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let (mapping, offset) = self.resolve(addr, 1)?;
        mapping.file.lock()?.read_u8(offset)
    }

    /// Reads a little-endian u16.
    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        let (mapping, offset) = self.resolve(addr, 2)?;
        mapping.file.lock()?.read_u16(offset)
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let (mapping, offset) = self.resolve(addr, 4)?;
        mapping.file.lock()?.read_u32(offset)
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let (mapping, offset) = self.resolve(addr, 8)?;
        mapping.file.lock()?.read_u64(offset)
    }

    /// Reads a NUL-terminated string starting at `addr`, bounded by the
    /// containing range.
    pub fn read_null_terminated_string(&self, addr: u64) -> Result<String> {
        let (range, mapping) = self
            .lookup(addr)
            .ok_or(Error::MappingRead { addr })?;
        let file = mapping.file.lock()?;
        let offset = mapping.file_offset + (addr - range.start);
        let max = (range.end - addr).min(file.len().saturating_sub(offset));
        let span = file.read_span(offset, max)?;
        let end = memchr_null(span);
        Ok(String::from_utf8_lossy(&span[..end]).into_owned())
    }

    /// Copies `length` bytes out of the VM. The read must not cross a range
    /// boundary.
    pub fn read_buffer(&self, addr: u64, length: u64) -> Result<Vec<u8>> {
        let (mapping, offset) = self.resolve(addr, length)?;
        mapping.file.lock()?.read_buffer(offset, length)
    }

    /// Copies bytes into `dest`.
    pub fn read_into(&self, dest: &mut [u8], addr: u64) -> Result<()> {
        let (mapping, offset) = self.resolve(addr, dest.len() as u64)?;
        mapping.file.lock()?.read_into(dest, offset)
    }
}

// =============================================================================
// VM Reader
// =============================================================================

/// A cursor over a [`Vm`] with configurable endianness and address size.
///
/// The plain `read_*` methods advance the cursor; the `*_at` variants read
/// at an absolute address without moving it.
#[derive(Debug)]
pub struct VmReader<'a> {
    vm: &'a Vm,
    cursor: u64,
    endianness: Endianness,
    address_size: usize,
}

impl<'a> VmReader<'a> {
    /// Creates a little-endian reader with 8-byte addresses at cursor 0.
    pub fn new(vm: &'a Vm) -> Self {
        Self::with_address_size(vm, 8)
    }

    /// Creates a reader with an explicit pointer width in bytes.
    pub fn with_address_size(vm: &'a Vm, address_size: usize) -> Self {
        Self {
            vm,
            cursor: 0,
            endianness: Endianness::Little,
            address_size,
        }
    }

    /// Sets the byte order for subsequent multi-byte reads.
    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// Returns the configured byte order.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Moves the cursor to an absolute address.
    pub fn seek(&mut self, addr: u64) {
        self.cursor = addr;
    }

    /// Moves the cursor by a signed delta.
    pub fn seek_relative(&mut self, delta: i64) {
        self.cursor = self.cursor.wrapping_add_signed(delta);
    }

    /// Returns the current cursor address.
    pub fn offset(&self) -> u64 {
        self.cursor
    }

    #[inline]
    fn swap16(&self, value: u16) -> u16 {
        match self.endianness {
            Endianness::Little => value,
            Endianness::Big => value.swap_bytes(),
        }
    }

    #[inline]
    fn swap32(&self, value: u32) -> u32 {
        match self.endianness {
            Endianness::Little => value,
            Endianness::Big => value.swap_bytes(),
        }
    }

    #[inline]
    fn swap64(&self, value: u64) -> u64 {
        match self.endianness {
            Endianness::Little => value,
            Endianness::Big => value.swap_bytes(),
        }
    }

    /// Reads a byte and advances.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.vm.read_u8(self.cursor)?;
        self.cursor += 1;
        Ok(value)
    }

    /// Reads a u16 and advances.
    pub fn read_u16(&mut self) -> Result<u16> {
        let value = self.vm.read_u16(self.cursor)?;
        self.cursor += 2;
        Ok(self.swap16(value))
    }

    /// Reads a u32 and advances.
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.vm.read_u32(self.cursor)?;
        self.cursor += 4;
        Ok(self.swap32(value))
    }

    /// Reads a u64 and advances.
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.vm.read_u64(self.cursor)?;
        self.cursor += 8;
        Ok(self.swap64(value))
    }

    /// Reads an address-sized pointer and advances.
    pub fn read_pointer(&mut self) -> Result<u64> {
        match self.address_size {
            4 => Ok(self.read_u32()? as u64),
            _ => self.read_u64(),
        }
    }

    /// Reads a u16 at an absolute address without advancing.
    pub fn read_u16_at(&self, addr: u64) -> Result<u16> {
        Ok(self.swap16(self.vm.read_u16(addr)?))
    }

    /// Reads a u32 at an absolute address without advancing.
    pub fn read_u32_at(&self, addr: u64) -> Result<u32> {
        Ok(self.swap32(self.vm.read_u32(addr)?))
    }

    /// Reads a u64 at an absolute address without advancing.
    pub fn read_u64_at(&self, addr: u64) -> Result<u64> {
        Ok(self.swap64(self.vm.read_u64(addr)?))
    }

    /// Reads a NUL-terminated string at an absolute address.
    pub fn read_cstring(&self, addr: u64) -> Result<String> {
        self.vm.read_null_terminated_string(addr)
    }

    /// Copies `length` bytes from the cursor and advances.
    pub fn read_buffer(&mut self, length: u64) -> Result<Vec<u8>> {
        let buffer = self.vm.read_buffer(self.cursor, length)?;
        self.cursor += length;
        Ok(buffer)
    }

    /// Copies `length` bytes at an absolute address without advancing.
    pub fn read_buffer_at(&self, addr: u64, length: u64) -> Result<Vec<u8>> {
        self.vm.read_buffer(addr, length)
    }

    /// Copies bytes into `dest` from the cursor and advances.
    pub fn read_into(&mut self, dest: &mut [u8]) -> Result<()> {
        self.vm.read_into(dest, self.cursor)?;
        self.cursor += dest.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dscload-vm-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn test_vm(name: &str, contents: &[u8]) -> (Vm, PathBuf) {
        let path = temp_file(name, contents);
        let vm = Vm::new(Arc::new(FilePool::default()), 1, 0x1000);
        (vm, path)
    }

    #[test]
    fn test_lookup_correctness() {
        let mut bytes = vec![0u8; 0x2000];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let (mut vm, path) = test_vm("lookup", &bytes);
        vm.map_pages(0x1_0000_0000, 0, 0x1000, &path, None).unwrap();
        vm.map_pages(0x2_0000_0000, 0x1000, 0x1000, &path, None).unwrap();

        for k in [0u64, 1, 0x7FF, 0xFFF] {
            let (mapping, within) = vm.mapping_at(0x1_0000_0000 + k).unwrap();
            assert_eq!(within, k);
            assert_eq!(mapping.file_offset, 0);
            assert_eq!(vm.read_u8(0x1_0000_0000 + k).unwrap(), (k % 251) as u8);
            assert_eq!(
                vm.read_u8(0x2_0000_0000 + k).unwrap(),
                ((0x1000 + k) % 251) as u8
            );
        }
        assert!(!vm.address_is_mapped(0x1_0000_1000));
        assert!(!vm.address_is_mapped(0xFFFF_FFFF));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_alignment_rejected() {
        let (mut vm, path) = test_vm("align", &[0u8; 0x1000]);
        let err = vm.map_pages(0x1008, 0, 0x1000, &path, None).unwrap_err();
        assert!(matches!(err, Error::MappingPageAlignment { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    #[should_panic(expected = "page mapping collision")]
    fn test_collision_panics() {
        let (mut vm, path) = test_vm("collide", &[0u8; 0x3000]);
        vm.map_pages(0x10000, 0, 0x2000, &path, None).unwrap();
        let _ = vm.map_pages(0x11000, 0, 0x1000, &path, None);
    }

    #[test]
    fn test_cross_range_read_fails() {
        let (mut vm, path) = test_vm("cross", &[0u8; 0x2000]);
        vm.map_pages(0x10000, 0, 0x1000, &path, None).unwrap();
        vm.map_pages(0x11000, 0x1000, 0x1000, &path, None).unwrap();

        // Contiguous VAs, but the read would span two ranges.
        let err = vm.read_buffer(0x10FFC, 8).unwrap_err();
        assert!(matches!(err, Error::MappingRead { .. }));
        let err = vm.read_u64(0x10FFC).unwrap_err();
        assert!(matches!(err, Error::MappingRead { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reader_cursor_and_endianness() {
        let (mut vm, path) = test_vm("reader", &[0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        // File shorter than a page still maps; reads past EOF error.
        vm.map_pages(0x4000, 0, 0x1000, &path, None).unwrap();

        let mut reader = VmReader::new(&vm);
        reader.seek(0x4000);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
        assert_eq!(reader.offset(), 0x4002);
        assert_eq!(reader.read_u16_at(0x4000).unwrap(), 0x0201);
        assert_eq!(reader.offset(), 0x4002);

        reader.set_endianness(Endianness::Big);
        assert_eq!(reader.read_u16_at(0x4000).unwrap(), 0x0102);
        reader.seek(0x4000);
        assert_eq!(reader.read_u32().unwrap(), 0x01020304);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_cstring() {
        let (mut vm, path) = test_vm("cstr", b"/usr/lib/libtest.dylib\0rest");
        vm.map_pages(0x8000, 0, 0x1000, &path, None).unwrap();
        assert_eq!(
            vm.read_null_terminated_string(0x8000).unwrap(),
            "/usr/lib/libtest.dylib"
        );
        std::fs::remove_file(&path).ok();
    }
}
