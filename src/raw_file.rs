// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! A file-backed implementation of [`BlockDev`].

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use libc::c_void;

use crate::device::{BlockDev, DiskInfo};
use crate::SECTOR_SIZE;

/// Presents a regular file as a resizable block device with a fixed sector
/// size (512 bytes unless overridden).
#[derive(Debug)]
pub struct RawFile {
    file: File,
    sector_size: u64,
    size_sectors: u64,
}

impl RawFile {
    /// Wraps `file` as a 512-byte-sector device.
    pub fn new(file: File) -> io::Result<RawFile> {
        RawFile::with_sector_size(file, SECTOR_SIZE)
    }

    /// Wraps `file` as a device with the given sector size, which must be a
    /// power of two of at least 512 bytes.
    pub fn with_sector_size(file: File, sector_size: u64) -> io::Result<RawFile> {
        assert!(sector_size.is_power_of_two() && sector_size >= SECTOR_SIZE);
        let len = file.metadata()?.len();
        Ok(RawFile {
            file,
            sector_size,
            size_sectors: len / sector_size,
        })
    }

    pub fn try_clone(&self) -> io::Result<RawFile> {
        Ok(RawFile {
            file: self.file.try_clone()?,
            sector_size: self.sector_size,
            size_sectors: self.size_sectors,
        })
    }

    fn check_buffer(&self, len: usize) -> io::Result<()> {
        if len as u64 % self.sector_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer is not a whole number of sectors",
            ));
        }
        Ok(())
    }
}

impl BlockDev for RawFile {
    fn info(&self) -> DiskInfo {
        DiskInfo {
            sector_size: self.sector_size,
            size_sectors: self.size_sectors,
            read_write: true,
        }
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_buffer(buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let offset = sector * self.sector_size + done as u64;
            // SAFETY: the pointer and length describe owned memory within
            // `buf`, which outlives the call.
            let ret = unsafe {
                libc::pread64(
                    self.file.as_raw_fd(),
                    buf[done..].as_mut_ptr() as *mut c_void,
                    buf.len() - done,
                    offset as libc::off64_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            done += ret as usize;
        }
        Ok(())
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        self.check_buffer(buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let offset = sector * self.sector_size + done as u64;
            // SAFETY: the pointer and length describe owned memory within
            // `buf`, which outlives the call.
            let ret = unsafe {
                libc::pwrite64(
                    self.file.as_raw_fd(),
                    buf[done..].as_ptr() as *const c_void,
                    buf.len() - done,
                    offset as libc::off64_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            done += ret as usize;
        }
        Ok(())
    }

    fn resize(&mut self, size_sectors: u64) -> io::Result<()> {
        self.file.set_len(size_sectors * self.sector_size)?;
        self.size_sectors = size_sectors;
        Ok(())
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::device::AlignedBuf;

    #[test]
    fn sector_round_trip() {
        let mut dev = RawFile::new(TempFile::new().unwrap().into_file()).unwrap();
        assert_eq!(dev.info().size_sectors, 0);

        dev.resize(8).unwrap();
        assert_eq!(dev.info().size_sectors, 8);
        assert_eq!(dev.info().sector_size, 512);

        let mut buf = AlignedBuf::zeroed(1024);
        buf[0] = 0xab;
        buf[1023] = 0xcd;
        dev.write(2, &buf).unwrap();

        let mut readback = AlignedBuf::zeroed(1024);
        dev.read(2, &mut readback).unwrap();
        assert_eq!(readback[0], 0xab);
        assert_eq!(readback[1023], 0xcd);
    }

    #[test]
    fn rejects_partial_sector_buffers() {
        let mut dev = RawFile::new(TempFile::new().unwrap().into_file()).unwrap();
        dev.resize(2).unwrap();
        let mut buf = AlignedBuf::zeroed(100);
        assert!(dev.read(0, &mut buf).is_err());
        assert!(dev.write(0, &buf).is_err());
    }

    #[test]
    fn large_sector_size() {
        let mut dev =
            RawFile::with_sector_size(TempFile::new().unwrap().into_file(), 4096).unwrap();
        dev.resize(4).unwrap();
        assert_eq!(dev.info().size_sectors, 4);

        let mut buf = AlignedBuf::zeroed(4096);
        buf[4095] = 0x55;
        dev.write(3, &buf).unwrap();
        let mut readback = AlignedBuf::zeroed(4096);
        dev.read(3, &mut readback).unwrap();
        assert_eq!(readback[4095], 0x55);
    }
}
