// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Sector-granular access to the backing device: field read-modify-write
//! primitives and cluster allocation.
//!
//! Nothing here is cached; every field access is a device I/O. Higher layers
//! that want caching add it above this one.

use std::io;

use byteorder::{BigEndian, ByteOrder};

use crate::address::{Geometry, Offset};
use crate::device::{AlignedBuf, BlockDev, DiskInfo};
use crate::util::{div_round_up_u64, ENTRY_SIZE};
use crate::{Error, Result};

/// Wraps a backing device with the image geometry. Allows reading and
/// writing table fields and appending clusters.
#[derive(Debug)]
pub struct QcowRawDevice<D> {
    dev: D,
    geometry: Geometry,
    // Index of the first unallocated cluster. Always equals the device size
    // in clusters; bumping it and resizing the device go together.
    next_cluster: u64,
}

impl<D: BlockDev> QcowRawDevice<D> {
    /// Wraps `dev`, failing if a cluster is not a whole number of the
    /// device's sectors.
    pub fn new(dev: D, cluster_bits: u32) -> Result<QcowRawDevice<D>> {
        let info = dev.info();
        let geometry = Geometry {
            cluster_bits,
            sector_size: info.sector_size,
        };
        let cluster_size = geometry.cluster_size();
        if info.sector_size == 0 || cluster_size % info.sector_size != 0 {
            return Err(Error::InvalidClusterSize);
        }
        let size_bytes = info.size_sectors * info.sector_size;
        Ok(QcowRawDevice {
            dev,
            geometry,
            next_cluster: div_round_up_u64(size_bytes, cluster_size),
        })
    }

    pub fn info(&self) -> DiskInfo {
        self.dev.info()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn sector_size(&self) -> u64 {
        self.geometry.sector_size
    }

    pub fn cluster_size(&self) -> u64 {
        self.geometry.cluster_size()
    }

    /// Returns the index of the first unallocated cluster.
    pub fn next_cluster(&self) -> u64 {
        self.next_cluster
    }

    /// Reads the sector containing `offset` into a fresh aligned buffer and
    /// returns it together with the position of `offset` inside it.
    pub fn read_field(&mut self, offset: u64) -> io::Result<(AlignedBuf, usize)> {
        let (sector, within) = self.geometry.to_sector(Offset::Bytes(offset));
        let mut buf = AlignedBuf::zeroed(self.geometry.sector_size as usize);
        self.dev.read(sector, &mut buf)?;
        Ok((buf, within as usize))
    }

    /// Read-modify-writes the sector containing `offset`. The mutator sees
    /// the sector contents from `offset` to the end of the sector; fields
    /// never span sector boundaries.
    pub fn update_field(
        &mut self,
        offset: u64,
        mutate: impl FnOnce(&mut [u8]),
    ) -> io::Result<()> {
        let (sector, within) = self.geometry.to_sector(Offset::Bytes(offset));
        let mut buf = AlignedBuf::zeroed(self.geometry.sector_size as usize);
        self.dev.read(sector, &mut buf)?;
        mutate(&mut buf[within as usize..]);
        self.dev.write(sector, &buf)
    }

    /// Reads one 8-byte big-endian table entry at `offset`.
    pub fn read_entry(&mut self, offset: u64) -> io::Result<u64> {
        let (buf, at) = self.read_field(offset)?;
        Ok(BigEndian::read_u64(&buf[at..at + ENTRY_SIZE as usize]))
    }

    /// Writes one 8-byte big-endian table entry at `offset`.
    pub fn write_entry(&mut self, offset: u64, value: u64) -> io::Result<()> {
        self.update_field(offset, |field| {
            BigEndian::write_u64(&mut field[..ENTRY_SIZE as usize], value)
        })
    }

    /// Writes whole sectors starting at the sector-aligned byte `offset`.
    pub fn write_block(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let (sector, within) = self.geometry.to_sector(Offset::Bytes(offset));
        if within != 0 || buf.len() as u64 % self.geometry.sector_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block write is not sector aligned",
            ));
        }
        self.dev.write(sector, buf)
    }

    /// Writes one full sector of caller data at the sector-aligned byte
    /// `offset`, bouncing through an aligned buffer.
    pub fn write_sector(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut buf = AlignedBuf::zeroed(self.geometry.sector_size as usize);
        buf.copy_from_slice(data);
        self.write_block(offset, &buf)
    }

    /// Zeros out a cluster of the device.
    pub fn zero_cluster(&mut self, address: u64) -> io::Result<()> {
        let buf = AlignedBuf::zeroed(self.geometry.cluster_size() as usize);
        self.write_block(address, &buf)
    }

    /// Allocates a new cluster at the end of the device and returns its byte
    /// address. The contents of the new cluster are undefined; callers zero
    /// or fill it before installing a pointer to it.
    pub fn extend(&mut self) -> Result<u64> {
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        self.resize(self.geometry.to_bytes(Offset::Clusters(self.next_cluster)))?;
        Ok(self.geometry.to_bytes(Offset::Clusters(cluster)))
    }

    /// Resizes the device to `new_size` bytes, which must be a whole number
    /// of sectors.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size % self.geometry.sector_size != 0 {
            return Err(Error::UnalignedSize(new_size));
        }
        self.dev
            .resize(new_size / self.geometry.sector_size)
            .map_err(Error::SettingDeviceSize)?;
        self.next_cluster = div_round_up_u64(new_size, self.geometry.cluster_size());
        Ok(())
    }

    /// Flushes and releases the device.
    pub fn disconnect(&mut self) -> io::Result<()> {
        self.dev.disconnect()
    }
}
