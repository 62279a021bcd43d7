// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Maintenance of the per-cluster 16-bit reference counters.

use byteorder::{BigEndian, ByteOrder};

use crate::device::{AlignedBuf, BlockDev};
use crate::header::QcowHeader;
use crate::qcow_raw_device::QcowRawDevice;
use crate::util::{ENTRY_SIZE, REFCOUNT_SIZE};
use crate::{Error, Result};

/// Represents the refcount entries for an open qcow file.
#[derive(Clone, Debug)]
pub struct RefCount {
    refcount_table_offset: u64,
    refcount_block_entries: u64, // number of refcounts in a cluster.
}

impl RefCount {
    pub fn new(header: &QcowHeader) -> RefCount {
        RefCount {
            refcount_table_offset: header.refcount_table_offset,
            refcount_block_entries: header.cluster_size() / REFCOUNT_SIZE,
        }
    }

    /// Returns the number of refcounts per block.
    pub fn refcounts_per_block(&self) -> u64 {
        self.refcount_block_entries
    }

    // Gets the refcount table index and the index into the pointed-to block
    // for a cluster index.
    fn refcount_index(&self, cluster_index: u64) -> (u64, u64) {
        (
            cluster_index / self.refcount_block_entries,
            cluster_index % self.refcount_block_entries,
        )
    }

    /// Increments the reference count of the cluster at `cluster_index`,
    /// installing a refcount block for its range first if there is none.
    pub fn increment<D: BlockDev>(
        &self,
        raw: &mut QcowRawDevice<D>,
        cluster_index: u64,
    ) -> Result<()> {
        let (table_index, block_index) = self.refcount_index(cluster_index);
        if table_index > 0 {
            return Err(Error::RefcountTableEnlargementNotSupported);
        }

        let entry_offset = self.refcount_table_offset + table_index * ENTRY_SIZE;
        let block_addr = raw
            .read_entry(entry_offset)
            .map_err(Error::ReadingRefCounts)?;

        if block_addr == 0 {
            // No block covers this range yet: build one with the single
            // counter already set, then point the table at it. The block's
            // own counter stays zero; accounting for it needs the table
            // growth this module does not do yet.
            let new_block = raw.extend()?;
            let mut block = AlignedBuf::zeroed(raw.cluster_size() as usize);
            let at = (block_index * REFCOUNT_SIZE) as usize;
            BigEndian::write_u16(&mut block[at..at + REFCOUNT_SIZE as usize], 1);
            raw.write_block(new_block, &block)
                .map_err(Error::WritingRefCounts)?;
            raw.write_entry(entry_offset, new_block)
                .map_err(Error::WritingRefCounts)?;
        } else {
            let counter_offset = block_addr + block_index * REFCOUNT_SIZE;
            raw.update_field(counter_offset, |field| {
                let count = BigEndian::read_u16(&field[..REFCOUNT_SIZE as usize]);
                BigEndian::write_u16(&mut field[..REFCOUNT_SIZE as usize], count + 1);
            })
            .map_err(Error::WritingRefCounts)?;
        }
        Ok(())
    }

    /// Gets the refcount of the cluster at `cluster_index`. Clusters whose
    /// range has no refcount block yet report zero.
    pub fn get<D: BlockDev>(
        &self,
        raw: &mut QcowRawDevice<D>,
        cluster_index: u64,
    ) -> Result<u16> {
        let (table_index, block_index) = self.refcount_index(cluster_index);
        if table_index > 0 {
            return Err(Error::RefcountTableEnlargementNotSupported);
        }

        let entry_offset = self.refcount_table_offset + table_index * ENTRY_SIZE;
        let block_addr = raw
            .read_entry(entry_offset)
            .map_err(Error::ReadingRefCounts)?;
        if block_addr == 0 {
            return Ok(0);
        }
        let counter_offset = block_addr + block_index * REFCOUNT_SIZE;
        let (buf, at) = raw
            .read_field(counter_offset)
            .map_err(Error::ReadingRefCounts)?;
        Ok(BigEndian::read_u16(&buf[at..at + REFCOUNT_SIZE as usize]))
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::raw_file::RawFile;

    // A raw device laid out like a fresh image: zeroed refcount table in
    // cluster 1, as create() builds it.
    fn device_with_refcount_table() -> (RefCount, QcowRawDevice<RawFile>) {
        let header = QcowHeader::create_for_size(0x10_0000).unwrap();
        let dev = RawFile::new(TempFile::new().unwrap().into_file()).unwrap();
        let mut raw = QcowRawDevice::new(dev, header.cluster_bits).unwrap();
        raw.resize(3 * header.cluster_size()).unwrap();
        raw.zero_cluster(header.refcount_table_offset).unwrap();
        (RefCount::new(&header), raw)
    }

    #[test]
    fn first_increment_installs_a_block() {
        let (refcounts, mut raw) = device_with_refcount_table();
        assert_eq!(refcounts.get(&mut raw, 0).unwrap(), 0);

        refcounts.increment(&mut raw, 0).unwrap();
        assert_eq!(refcounts.get(&mut raw, 0).unwrap(), 1);
        // The block went to the first free cluster.
        assert_eq!(raw.next_cluster(), 4);
        let table_entry = raw.read_entry(0x1_0000).unwrap();
        assert_eq!(table_entry, 3 * 0x1_0000);
        // Its own counter is not accounted for.
        assert_eq!(refcounts.get(&mut raw, 3).unwrap(), 0);
    }

    #[test]
    fn increments_accumulate() {
        let (refcounts, mut raw) = device_with_refcount_table();
        refcounts.increment(&mut raw, 5).unwrap();
        refcounts.increment(&mut raw, 5).unwrap();
        refcounts.increment(&mut raw, 6).unwrap();
        assert_eq!(refcounts.get(&mut raw, 5).unwrap(), 2);
        assert_eq!(refcounts.get(&mut raw, 6).unwrap(), 1);
        assert_eq!(refcounts.get(&mut raw, 4).unwrap(), 0);
    }

    #[test]
    fn rejects_clusters_past_the_first_block() {
        let (refcounts, mut raw) = device_with_refcount_table();
        let out_of_range = refcounts.refcounts_per_block();
        assert!(matches!(
            refcounts.increment(&mut raw, out_of_range),
            Err(Error::RefcountTableEnlargementNotSupported)
        ));
        assert!(matches!(
            refcounts.get(&mut raw, out_of_range),
            Err(Error::RefcountTableEnlargementNotSupported)
        ));
    }
}
