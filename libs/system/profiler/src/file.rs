// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

use anyhow::{ensure, Context, Result};
use memmap::{MmapMut, MmapOptions};
use std::{fs::File, path::Path};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

/// Page-aligned writable window into the profile file. Owns its mapping;
/// dropping flushes through the OS.
pub struct MappedRegion {
    map: MmapMut,
    pub offset: u64,
}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// View the region's head as a typed record.
    pub fn as_ref<T: FromBytes>(&self) -> &T {
        LayoutVerified::<&[u8], T>::new(&self.map[..std::mem::size_of::<T>()])
            .expect("mapped region layout")
            .into_ref()
    }

    pub fn as_mut<T: FromBytes + AsBytes>(&mut self) -> &mut T {
        LayoutVerified::<&mut [u8], T>::new(&mut self.map[..std::mem::size_of::<T>()])
            .expect("mapped region layout")
            .into_mut()
    }
}

/// The profile file plus its growth cursor. All mapping offsets must be
/// page-aligned; the format guarantees it.
pub struct ProfileFile {
    file: File,
    page_size: u64,
    len: u64,
}

impl ProfileFile {
    pub fn create(path: &Path, page_size: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating profile file {:?}", path))?;
        Ok(Self {
            file,
            page_size,
            len: 0,
        })
    }

    pub fn open(path: &Path, page_size: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening profile file {:?}", path))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            page_size,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Grow the file to at least `len` bytes.
    pub fn ensure_len(&mut self, len: u64) -> Result<()> {
        if len > self.len {
            self.file.set_len(len)?;
            self.len = len;
        }
        Ok(())
    }

    /// Map `[offset, offset + len)` read-write.
    pub fn map(&mut self, offset: u64, len: usize) -> Result<MappedRegion> {
        ensure!(
            offset % self.page_size == 0,
            "mapping offset {} is not page aligned",
            offset
        );
        self.ensure_len(offset + len as u64)?;
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file)? };
        Ok(MappedRegion { map, offset })
    }
}
