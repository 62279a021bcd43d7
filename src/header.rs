// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 v2 header parsing, validation, and creation.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::util::{div_round_up_u64, ENTRY_SIZE};
use crate::{Error, Result};

// QCOW magic constant that starts the header.
pub(crate) const QCOW_MAGIC: u32 = 0x5146_49fb;
// Only the original v2 layout is handled here.
pub(crate) const SUPPORTED_VERSION: u32 = 2;
// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS
pub(crate) const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to reasonable sizes. Choose the same limits as qemu. Making
// the clusters smaller increases the amount of overhead for book keeping.
pub(crate) const MIN_CLUSTER_BITS: u32 = 9;
pub(crate) const MAX_CLUSTER_BITS: u32 = 21;
// Maximum data size supported.
pub(crate) const MAX_QCOW_FILE_SIZE: u64 = 0x01 << 44; // 16 TB.

/// Contains the information from the header of a qcow file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QcowHeader {
    pub magic: u32,
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
}

impl QcowHeader {
    /// Parses a header from the first sector of an image.
    pub fn parse(bytes: &[u8]) -> Result<QcowHeader> {
        let mut r = bytes;

        // Reads the next u32 from the buffer.
        fn read_u32_be(r: &mut &[u8]) -> Result<u32> {
            r.read_u32::<BigEndian>().map_err(Error::ReadingHeader)
        }

        // Reads the next u64 from the buffer.
        fn read_u64_be(r: &mut &[u8]) -> Result<u64> {
            r.read_u64::<BigEndian>().map_err(Error::ReadingHeader)
        }

        let magic = read_u32_be(&mut r)?;
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = read_u32_be(&mut r)?;
        if version != SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let header = QcowHeader {
            magic,
            version,
            backing_file_offset: read_u64_be(&mut r)?,
            backing_file_size: read_u32_be(&mut r)?,
            cluster_bits: read_u32_be(&mut r)?,
            size: read_u64_be(&mut r)?,
            crypt_method: read_u32_be(&mut r)?,
            l1_size: read_u32_be(&mut r)?,
            l1_table_offset: read_u64_be(&mut r)?,
            refcount_table_offset: read_u64_be(&mut r)?,
            refcount_table_clusters: read_u32_be(&mut r)?,
            nb_snapshots: read_u32_be(&mut r)?,
            snapshots_offset: read_u64_be(&mut r)?,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.backing_file_offset != 0 || self.backing_file_size != 0 {
            return Err(Error::BackingFilesNotSupported);
        }
        if self.crypt_method != 0 {
            return Err(Error::CryptMethodNotSupported);
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterSize);
        }
        if self.size == 0 {
            return Err(Error::InvalidVirtualSize(self.size));
        }
        if self.size > MAX_QCOW_FILE_SIZE {
            return Err(Error::FileTooBig(self.size));
        }

        let cluster_size = 0x01u64 << self.cluster_bits;
        if self.l1_table_offset == 0 || self.l1_table_offset % cluster_size != 0 {
            return Err(Error::InvalidL1TableOffset);
        }
        if self.refcount_table_offset == 0 || self.refcount_table_offset % cluster_size != 0 {
            return Err(Error::InvalidRefcountTableOffset);
        }
        if self.refcount_table_clusters == 0 {
            return Err(Error::InvalidRefcountTableSize(
                self.refcount_table_clusters as u64,
            ));
        }
        // Each L1 entry covers a full L2 table's worth of data.
        let bytes_per_l2 = 0x01u64 << (2 * self.cluster_bits - 3);
        if (self.l1_size as u64) < div_round_up_u64(self.size, bytes_per_l2) {
            return Err(Error::InvalidL1TableSize(self.l1_size));
        }
        Ok(())
    }

    /// Builds a header for a fresh image of `size` virtual bytes.
    ///
    /// The fixed creation layout is: header in cluster 0, a one-cluster
    /// refcount table in cluster 1, and the L1 table starting at cluster 2.
    pub fn create_for_size(size: u64) -> Result<QcowHeader> {
        let cluster_bits = DEFAULT_CLUSTER_BITS;
        let cluster_size = 0x01u64 << cluster_bits;
        let bytes_per_l2 = 0x01u64 << (2 * cluster_bits - 3);

        let header = QcowHeader {
            magic: QCOW_MAGIC,
            version: SUPPORTED_VERSION,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: div_round_up_u64(size, bytes_per_l2) as u32,
            l1_table_offset: 2 * cluster_size,
            refcount_table_offset: cluster_size,
            refcount_table_clusters: 1,
            nb_snapshots: 0,
            snapshots_offset: 0,
        };
        header.validate()?;
        Ok(header)
    }

    /// Serializes the header into the front of `buf`, which the caller has
    /// zeroed.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        let mut w = buf;

        // Writes the next u32 to the buffer.
        fn write_u32_be(w: &mut &mut [u8], value: u32) -> Result<()> {
            w.write_u32::<BigEndian>(value).map_err(Error::WritingHeader)
        }

        // Writes the next u64 to the buffer.
        fn write_u64_be(w: &mut &mut [u8], value: u64) -> Result<()> {
            w.write_u64::<BigEndian>(value).map_err(Error::WritingHeader)
        }

        write_u32_be(&mut w, self.magic)?;
        write_u32_be(&mut w, self.version)?;
        write_u64_be(&mut w, self.backing_file_offset)?;
        write_u32_be(&mut w, self.backing_file_size)?;
        write_u32_be(&mut w, self.cluster_bits)?;
        write_u64_be(&mut w, self.size)?;
        write_u32_be(&mut w, self.crypt_method)?;
        write_u32_be(&mut w, self.l1_size)?;
        write_u64_be(&mut w, self.l1_table_offset)?;
        write_u64_be(&mut w, self.refcount_table_offset)?;
        write_u32_be(&mut w, self.refcount_table_clusters)?;
        write_u32_be(&mut w, self.nb_snapshots)?;
        write_u64_be(&mut w, self.snapshots_offset)?;
        Ok(())
    }

    /// Returns the size of a cluster in bytes.
    pub fn cluster_size(&self) -> u64 {
        0x01 << self.cluster_bits
    }

    /// Returns the number of clusters occupied by the L1 table.
    pub(crate) fn l1_clusters(&self) -> u64 {
        div_round_up_u64(self.l1_size as u64 * ENTRY_SIZE, self.cluster_size())
    }
}
