// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Sparse, copy-on-write QCOW2 v2 disk images over resizable block devices.
//!
//! [`QcowDisk`] presents a virtual disk of fixed 512-byte sectors on top of
//! any [`BlockDev`]. Virtual addresses translate through the image's
//! two-level lookup tables (L1 entry, L2 entry, byte within the data
//! cluster); clusters are appended to the backing device on first write and
//! tracked in the image's refcount table so they can later be shared or
//! freed. Unwritten regions read back as zeros and consume no backing
//! storage.
//!
//! Every table access is a physical I/O against the backing device, so a
//! virtual I/O typically costs three device round trips. That is deliberate:
//! this layer stays simple and correct, and callers that need fewer round
//! trips put a cache above it.

mod address;
mod device;
mod header;
mod qcow_raw_device;
mod raw_file;
mod refcount;
mod util;

use std::cmp::{max, min};
use std::io;
use std::result;

use log::{error, warn};
use remain::sorted;
use thiserror::Error;

use crate::address::Address;
use crate::qcow_raw_device::QcowRawDevice;
use crate::refcount::RefCount;
use crate::util::{
    div_round_up_u64, entry_cluster_addr, entry_is_compressed, entry_make, ENTRY_SIZE,
};

pub use crate::address::{Geometry, Offset};
pub use crate::device::{AlignedBuf, BlockDev, DiskInfo, BUFFER_ALIGNMENT};
pub use crate::header::QcowHeader;
pub use crate::raw_file::RawFile;

const SECTOR_SHIFT: u8 = 9;
/// Size in bytes of the virtual sectors a [`QcowDisk`] presents, independent
/// of the backing device's sector size.
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("backing files are not supported")]
    BackingFilesNotSupported,
    #[error("failed to flush the backing device")]
    ClosingDevice(#[source] io::Error),
    #[error("compressed blocks are not supported")]
    CompressedBlocksNotSupported,
    #[error("encrypted images are not supported")]
    CryptMethodNotSupported,
    #[error("virtual size {0} is larger than the maximum supported")]
    FileTooBig(u64),
    #[error("cluster size is not valid for the backing device")]
    InvalidClusterSize,
    #[error("L1 table offset is invalid")]
    InvalidL1TableOffset,
    #[error("L1 table size {0} does not cover the virtual disk")]
    InvalidL1TableSize(u32),
    #[error("magic number is invalid")]
    InvalidMagic,
    #[error("offset {0} is outside the virtual disk")]
    InvalidOffset(u64),
    #[error("refcount table offset is invalid")]
    InvalidRefcountTableOffset,
    #[error("refcount table size {0} is invalid")]
    InvalidRefcountTableSize(u64),
    #[error("virtual size {0} is invalid")]
    InvalidVirtualSize(u64),
    #[error("failed to read data from the backing device")]
    ReadingData(#[source] io::Error),
    #[error("failed to read the image header")]
    ReadingHeader(#[source] io::Error),
    #[error("failed to read a table pointer")]
    ReadingPointers(#[source] io::Error),
    #[error("failed to read a refcount")]
    ReadingRefCounts(#[source] io::Error),
    #[error("refcount table enlargement is not implemented")]
    RefcountTableEnlargementNotSupported,
    #[error("failed to resize the backing device")]
    SettingDeviceSize(#[source] io::Error),
    #[error("size {0} is not a whole number of sectors")]
    UnalignedSize(u64),
    #[error("version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("failed to write data to the backing device")]
    WritingData(#[source] io::Error),
    #[error("failed to write the image header")]
    WritingHeader(#[source] io::Error),
    #[error("failed to write a table pointer")]
    WritingPointers(#[source] io::Error),
    #[error("failed to write a refcount")]
    WritingRefCounts(#[source] io::Error),
    #[error("write translated to an unallocated cluster")]
    WritingUnmappedCluster,
}

pub type Result<T> = result::Result<T, Error>;

/// A QCOW2 v2 image open on a backing device.
///
/// The device is exclusively owned until [`QcowDisk::disconnect`]. All
/// operations take `&mut self`, which serializes them per image.
#[derive(Debug)]
pub struct QcowDisk<D> {
    raw: QcowRawDevice<D>,
    header: QcowHeader,
    refcounts: RefCount,
}

impl<D: BlockDev> QcowDisk<D> {
    /// Creates a fresh image of `virtual_size` bytes on `dev`, overwriting
    /// whatever the device holds.
    pub fn create(dev: D, virtual_size: u64) -> Result<QcowDisk<D>> {
        let header = QcowHeader::create_for_size(virtual_size)?;
        let mut raw = QcowRawDevice::new(dev, header.cluster_bits)?;
        let cluster_size = header.cluster_size();
        let l1_clusters = header.l1_clusters();

        // Room for the header, the refcount table and the L1 table.
        raw.resize((2 + l1_clusters) * cluster_size)?;

        // The header must land before any structure a reader would locate
        // through it.
        let mut page = AlignedBuf::zeroed(raw.sector_size() as usize);
        header.write_to(&mut page)?;
        raw.write_block(0, &page).map_err(Error::WritingHeader)?;

        raw.zero_cluster(header.refcount_table_offset)
            .map_err(Error::WritingRefCounts)?;

        let refcounts = RefCount::new(&header);
        // The metadata clusters themselves are allocated: the header, the
        // refcount table, and each L1 table cluster.
        refcounts.increment(&mut raw, 0)?;
        refcounts.increment(&mut raw, header.refcount_table_offset / cluster_size)?;
        let l1_cluster = header.l1_table_offset / cluster_size;
        for index in 0..l1_clusters {
            refcounts.increment(&mut raw, l1_cluster + index)?;
        }

        for index in 0..l1_clusters {
            raw.zero_cluster(header.l1_table_offset + index * cluster_size)
                .map_err(Error::WritingPointers)?;
        }

        Ok(QcowDisk {
            raw,
            header,
            refcounts,
        })
    }

    /// Opens the existing image on `dev`.
    pub fn connect(dev: D) -> Result<QcowDisk<D>> {
        let mut dev = dev;
        let info = dev.info();
        if !info.read_write {
            warn!("backing device is read-only, writes will fail");
        }

        let mut sector = AlignedBuf::zeroed(info.sector_size as usize);
        dev.read(0, &mut sector).map_err(Error::ReadingHeader)?;
        let header = QcowHeader::parse(&sector)?;

        let raw = QcowRawDevice::new(dev, header.cluster_bits)?;
        let refcounts = RefCount::new(&header);
        Ok(QcowDisk {
            raw,
            header,
            refcounts,
        })
    }

    /// Returns the virtual disk's properties: 512-byte sectors, writability
    /// inherited from the backing device.
    pub fn info(&self) -> DiskInfo {
        DiskInfo {
            sector_size: SECTOR_SIZE,
            size_sectors: self.header.size / SECTOR_SIZE,
            read_write: self.raw.info().read_write,
        }
    }

    /// Returns the index of the first unallocated cluster on the backing
    /// device. This is only useful for debugging.
    pub fn next_cluster(&self) -> u64 {
        self.raw.next_cluster()
    }

    /// Returns the reference count of a cluster of the backing device. This
    /// is only useful for debugging.
    pub fn cluster_refcount(&mut self, cluster_index: u64) -> Result<u16> {
        self.refcounts.get(&mut self.raw, cluster_index)
    }

    /// Reads whole virtual sectors starting at `virtual_sector` into the
    /// buffers in order. Unmapped regions read as zeros.
    pub fn read(&mut self, virtual_sector: u64, bufs: &mut [&mut [u8]]) -> Result<()> {
        let phys = self.raw.sector_size();
        let mut vsector = virtual_sector;
        for buf in bufs.iter_mut() {
            let len = buf.len();
            let mut offset = vsector
                .checked_mul(SECTOR_SIZE)
                .ok_or(Error::InvalidOffset(vsector))?;
            let mut pos = 0usize;
            // Pieces of at most one physical sector, split on physical
            // sector boundaries.
            while pos < len {
                let within = offset % phys;
                let piece = min(len - pos, (phys - within) as usize);
                self.read_piece(offset, &mut buf[pos..pos + piece])?;
                pos += piece;
                offset += piece as u64;
            }
            vsector += max(1, div_round_up_u64(len as u64, SECTOR_SIZE));
        }
        Ok(())
    }

    /// Writes whole virtual sectors starting at `virtual_sector` from the
    /// buffers in order, allocating clusters and tables as needed.
    pub fn write(&mut self, virtual_sector: u64, bufs: &[&[u8]]) -> Result<()> {
        let phys = self.raw.sector_size();
        let mut vsector = virtual_sector;
        for buf in bufs.iter() {
            let len = buf.len();
            let mut offset = vsector
                .checked_mul(SECTOR_SIZE)
                .ok_or(Error::InvalidOffset(vsector))?;
            let mut pos = 0usize;
            while pos < len {
                let within = offset % phys;
                let piece = min(len - pos, (phys - within) as usize);
                self.write_piece(offset, &buf[pos..pos + piece])?;
                pos += piece;
                offset += piece as u64;
            }
            vsector += max(1, div_round_up_u64(len as u64, SECTOR_SIZE));
        }
        Ok(())
    }

    /// Flushes and releases the backing device.
    pub fn disconnect(mut self) -> Result<()> {
        self.raw.disconnect().map_err(Error::ClosingDevice)
    }

    /// Translates the virtual `address` to a byte offset on the backing
    /// device, or `None` if nothing is mapped there. With `allocate`,
    /// missing L2 tables and data clusters are allocated, refcounted and
    /// installed along the way, so `Some` is guaranteed.
    fn walk(&mut self, address: Address, allocate: bool) -> Result<Option<u64>> {
        let l1_entry_offset = self.header.l1_table_offset + address.l1_index * ENTRY_SIZE;
        let l1_entry = self
            .raw
            .read_entry(l1_entry_offset)
            .map_err(Error::ReadingPointers)?;
        if entry_is_compressed(l1_entry) {
            return Err(Error::CompressedBlocksNotSupported);
        }

        let mut l2_table = entry_cluster_addr(l1_entry);
        if l2_table == 0 {
            if !allocate {
                return Ok(None);
            }
            l2_table = self.install_cluster(l1_entry_offset)?;
        }

        let l2_entry_offset = l2_table + address.l2_index * ENTRY_SIZE;
        let l2_entry = self
            .raw
            .read_entry(l2_entry_offset)
            .map_err(Error::ReadingPointers)?;
        if entry_is_compressed(l2_entry) {
            return Err(Error::CompressedBlocksNotSupported);
        }

        let mut cluster = entry_cluster_addr(l2_entry);
        if cluster == 0 {
            if !allocate {
                return Ok(None);
            }
            cluster = self.install_cluster(l2_entry_offset)?;
        }

        Ok(Some(cluster + address.cluster))
    }

    /// Allocates a zeroed, refcounted cluster and points the table entry at
    /// `entry_offset` to it. The entry is only updated once the cluster's
    /// contents and refcount are on the device.
    fn install_cluster(&mut self, entry_offset: u64) -> Result<u64> {
        let addr = self.raw.extend()?;
        let cluster_index = self.raw.geometry().to_cluster(Offset::Bytes(addr));
        self.raw.zero_cluster(addr).map_err(Error::WritingData)?;
        self.refcounts.increment(&mut self.raw, cluster_index)?;
        self.raw
            .write_entry(entry_offset, entry_make(addr))
            .map_err(Error::WritingPointers)?;
        Ok(addr)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.header.size => Ok(()),
            _ => Err(Error::InvalidOffset(offset)),
        }
    }

    // Reads one piece that fits inside a single physical sector.
    fn read_piece(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let address = Address::new(offset, self.header.cluster_bits);
        match self.walk(address, false)? {
            None => buf.fill(0),
            Some(mapped) => {
                let (sector, at) = self.raw.read_field(mapped).map_err(Error::ReadingData)?;
                buf.copy_from_slice(&sector[at..at + buf.len()]);
            }
        }
        Ok(())
    }

    // Writes one piece that fits inside a single physical sector.
    fn write_piece(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let address = Address::new(offset, self.header.cluster_bits);
        let mapped = match self.walk(address, true)? {
            Some(mapped) => mapped,
            None => {
                error!("write at offset {offset} translated to no cluster");
                return Err(Error::WritingUnmappedCluster);
            }
        };

        let phys = self.raw.sector_size();
        if mapped % phys == 0 && buf.len() as u64 == phys {
            self.raw.write_sector(mapped, buf).map_err(Error::WritingData)
        } else {
            self.raw
                .update_field(mapped, |field| {
                    field[..buf.len()].copy_from_slice(buf);
                })
                .map_err(Error::WritingData)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::unix::fs::FileExt;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::util::TABLE_OFFSET_MASK;

    const MB: u64 = 0x10_0000;
    const CLUSTER: u64 = 0x1_0000;

    fn disk_and_file(virtual_size: u64) -> (QcowDisk<RawFile>, File) {
        let file = TempFile::new().unwrap().into_file();
        let dev = RawFile::new(file.try_clone().unwrap()).unwrap();
        let disk = QcowDisk::create(dev, virtual_size).expect("failed to create image");
        (disk, file)
    }

    fn default_disk(virtual_size: u64) -> QcowDisk<RawFile> {
        disk_and_file(virtual_size).0
    }

    #[test]
    fn create_and_reopen() {
        let (mut disk, file) = disk_and_file(16 * MB);
        let data = [0xc3u8; 512];
        disk.write(9, &[&data[..]]).expect("failed to write");
        disk.disconnect().expect("failed to disconnect");

        let mut disk = QcowDisk::connect(RawFile::new(file).unwrap()).expect("failed to reopen");
        let info = disk.info();
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.size_sectors, 32768);
        assert!(info.read_write);

        let mut readback = [0u8; 512];
        disk.read(9, &mut [&mut readback[..]]).expect("failed to read");
        assert_eq!(readback, data);
    }

    #[test]
    fn refcounts_after_create() {
        let (mut disk, _file) = disk_and_file(16 * MB);
        // Header, refcount table and L1 table are each one accounted cluster.
        assert_eq!(disk.cluster_refcount(0).unwrap(), 1);
        assert_eq!(disk.cluster_refcount(1).unwrap(), 1);
        assert_eq!(disk.cluster_refcount(2).unwrap(), 1);
        // The refcount block itself is allocated but not accounted.
        assert_eq!(disk.cluster_refcount(3).unwrap(), 0);
        assert_eq!(disk.next_cluster(), 4);
    }

    #[test]
    fn unmapped_sectors_read_as_zeros() {
        let mut disk = default_disk(256 * 1024);
        let mut buf = vec![0xffu8; 256 * 1024];
        disk.read(0, &mut [&mut buf[..]]).expect("failed to read");
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn sparse_write_and_read_back() {
        let (mut disk, file) = disk_and_file(1024 * MB);

        let data = [0xaau8; 512];
        disk.write(0, &[&data[..]]).expect("failed to write");

        let mut readback = [0u8; 512];
        disk.read(0, &mut [&mut readback[..]])
            .expect("failed to read");
        assert_eq!(readback, data);

        // The next cluster over is still unmapped.
        let mut hole = [0xffu8; 512];
        disk.read(CLUSTER / SECTOR_SIZE, &mut [&mut hole[..]])
            .expect("failed to read");
        assert!(hole.iter().all(|b| *b == 0));

        // One sector of payload holds the backing size to the metadata area
        // plus a handful of clusters: refcount block, L2 table, data.
        let backing_size = file.metadata().unwrap().len();
        assert!(backing_size <= (3 + 4) * CLUSTER, "{backing_size}");
    }

    #[test]
    fn write_bumps_next_cluster_by_table_and_data() {
        let mut disk = default_disk(MB);
        let before = disk.next_cluster();

        let data = [0x5au8; 512];
        disk.write(64, &[&data[..]]).expect("failed to write");

        // At least an L2 table and a data cluster were appended.
        assert!(disk.next_cluster() >= before + 2);
        let after = disk.next_cluster();

        // Re-writing the same sector allocates nothing further.
        disk.write(64, &[&data[..]]).expect("failed to write");
        assert_eq!(disk.next_cluster(), after);
    }

    #[test]
    fn cross_cluster_write_round_trips() {
        let mut disk = default_disk(MB);

        // Sectors 127 and 128 straddle the first 64 KiB cluster boundary.
        let mut first = [0u8; 512];
        let mut second = [0u8; 512];
        for i in 0..512usize {
            first[i] = (i % 251) as u8;
            second[i] = ((i + 512) % 251) as u8;
        }
        disk.write(127, &[&first[..], &second[..]])
            .expect("failed to write");

        let mut readback = vec![0u8; 1024];
        disk.read(127, &mut [&mut readback[..]])
            .expect("failed to read");
        assert_eq!(&readback[..512], &first[..]);
        assert_eq!(&readback[512..], &second[..]);
    }

    #[test]
    fn far_sector_round_trips() {
        let mut disk = default_disk(1024 * MB);
        // Past 512 MiB, so the second L1 entry and a second L2 table are in
        // play.
        let data = [0x77u8; 512];
        disk.write(1_050_000, &[&data[..]]).expect("failed to write");

        let mut readback = [0u8; 512];
        disk.read(1_050_000, &mut [&mut readback[..]])
            .expect("failed to read");
        assert_eq!(readback, data);

        let mut hole = [0xffu8; 512];
        disk.read(1_000_000, &mut [&mut hole[..]])
            .expect("failed to read");
        assert!(hole.iter().all(|b| *b == 0));
    }

    #[test]
    fn connects_to_small_cluster_images() {
        // A hand-built 64 KiB image with 512 byte clusters: header in
        // cluster 0, refcount table in cluster 1, two-entry L1 in cluster 2.
        let header = QcowHeader {
            magic: 0x5146_49fb,
            version: 2,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits: 9,
            size: 0x1_0000,
            crypt_method: 0,
            l1_size: 2,
            l1_table_offset: 1024,
            refcount_table_offset: 512,
            refcount_table_clusters: 1,
            nb_snapshots: 0,
            snapshots_offset: 0,
        };
        let mut sector = vec![0u8; 512];
        header.write_to(&mut sector).unwrap();

        let file = TempFile::new().unwrap().into_file();
        file.set_len(3 * 512).unwrap();
        file.write_all_at(&sector, 0).unwrap();

        let dev = RawFile::new(file).unwrap();
        let mut disk = QcowDisk::connect(dev).expect("failed to connect");
        assert_eq!(disk.info().size_sectors, 128);

        // Sector 64 needs the second L1 entry at this cluster size.
        let data = [0x99u8; 512];
        disk.write(64, &[&data[..]]).expect("failed to write");
        let mut readback = [0u8; 512];
        disk.read(64, &mut [&mut readback[..]]).expect("failed to read");
        assert_eq!(readback, data);

        let mut hole = [0xffu8; 512];
        disk.read(63, &mut [&mut hole[..]]).expect("failed to read");
        assert!(hole.iter().all(|b| *b == 0));
    }

    #[test]
    fn allocations_set_the_copied_bit() {
        let (mut disk, file) = disk_and_file(MB);
        let data = [0x11u8; 512];
        disk.write(0, &[&data[..]]).expect("failed to write");

        let mut entry = [0u8; 8];
        file.read_exact_at(&mut entry, 2 * CLUSTER).unwrap();
        let l1_entry = u64::from_be_bytes(entry);
        assert_eq!(l1_entry & (1 << 63), 1 << 63);

        let l2_offset = l1_entry & TABLE_OFFSET_MASK;
        file.read_exact_at(&mut entry, l2_offset).unwrap();
        let l2_entry = u64::from_be_bytes(entry);
        assert_eq!(l2_entry & (1 << 63), 1 << 63);
        // Allocated clusters start on cluster boundaries.
        assert_eq!((l2_entry & TABLE_OFFSET_MASK) % CLUSTER, 0);
    }

    #[test]
    fn compressed_cluster_is_fatal() {
        let (mut disk, file) = disk_and_file(MB);
        let data = [0x22u8; 512];
        disk.write(0, &[&data[..]]).expect("failed to write");

        // Mark the data cluster compressed behind the engine's back.
        let mut entry = [0u8; 8];
        file.read_exact_at(&mut entry, 2 * CLUSTER).unwrap();
        let l2_offset = u64::from_be_bytes(entry) & TABLE_OFFSET_MASK;
        file.read_exact_at(&mut entry, l2_offset).unwrap();
        let poisoned = u64::from_be_bytes(entry) | (1 << 62);
        file.write_all_at(&poisoned.to_be_bytes(), l2_offset).unwrap();

        let mut readback = [0u8; 512];
        assert!(matches!(
            disk.read(0, &mut [&mut readback[..]]),
            Err(Error::CompressedBlocksNotSupported)
        ));
    }

    #[test]
    fn rejects_out_of_range_io() {
        let mut disk = default_disk(MB);
        let mut buf = [0u8; 512];
        let end_sector = MB / SECTOR_SIZE;
        assert!(matches!(
            disk.read(end_sector, &mut [&mut buf[..]]),
            Err(Error::InvalidOffset(_))
        ));
        assert!(matches!(
            disk.write(end_sector, &[&buf[..]]),
            Err(Error::InvalidOffset(_))
        ));
        // The last in-range sector is fine.
        disk.read(end_sector - 1, &mut [&mut buf[..]])
            .expect("failed to read");
    }

    #[test]
    fn large_physical_sectors_round_trip() {
        let file = TempFile::new().unwrap().into_file();
        let dev = RawFile::with_sector_size(file, 4096).unwrap();
        let mut disk = QcowDisk::create(dev, MB).expect("failed to create image");

        // A single virtual sector lands inside a 4 KiB physical sector and
        // takes the read-modify-write path.
        let data = [0x33u8; 512];
        disk.write(3, &[&data[..]]).expect("failed to write");
        let mut readback = [0u8; 512];
        disk.read(3, &mut [&mut readback[..]]).expect("failed to read");
        assert_eq!(readback, data);

        // Neighbouring virtual sectors in the same physical sector are
        // untouched.
        let mut hole = [0xffu8; 512];
        disk.read(2, &mut [&mut hole[..]]).expect("failed to read");
        assert!(hole.iter().all(|b| *b == 0));

        // A buffer spanning several physical sectors is chopped and written
        // whole-sector where it can be.
        let big: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        disk.write(16, &[&big[..]]).expect("failed to write");
        let mut big_readback = vec![0u8; 8192];
        disk.read(16, &mut [&mut big_readback[..]])
            .expect("failed to read");
        assert_eq!(big_readback, big);
    }

    #[test]
    fn connect_rejects_garbage() {
        let file = TempFile::new().unwrap().into_file();
        file.set_len(4096).unwrap();
        file.write_all_at(b"not a qcow image", 0).unwrap();
        let dev = RawFile::new(file).unwrap();
        assert!(matches!(QcowDisk::connect(dev), Err(Error::InvalidMagic)));
    }
}
