use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{anyhow, bail, Context, Result};

/// A window over `[start, start + len)` of a disk image file.
///
/// Writes past the end of the window fail instead of spilling into the
/// neighbouring structure.
pub struct RegionIo {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl RegionIo {
    pub fn new(file: File, start: u64, len: u64) -> Self {
        Self {
            file,
            start,
            len,
            pos: 0,
        }
    }

    pub fn open(disk: &Path, start: u64, len: u64) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(disk)
            .map_err(|e| anyhow!("failed to open disk {}: {e}", disk.display()))?;
        let disk_len = file.metadata()?.len();
        if start + len > disk_len {
            bail!(
                "region {start}+{len} is outside disk {} ({disk_len} bytes)",
                disk.display()
            );
        }
        Ok(Self::new(file, start, len))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("failed to sync disk image")
    }

    fn clamp_pos(&self, pos: i128) -> io::Result<u64> {
        if pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid seek"));
        }
        let pos = pos as u64;
        if pos > self.len {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"));
        }
        Ok(pos)
    }
}

impl Read for RegionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remain = self.len - self.pos;
        let to_read = remain.min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for RegionIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "no space"));
        }
        let remain = self.len - self.pos;
        let to_write = remain.min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.write(&buf[..to_write])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for RegionIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => self.clamp_pos(off as i128)?,
            SeekFrom::End(off) => self.clamp_pos(self.len as i128 + off as i128)?,
            SeekFrom::Current(off) => self.clamp_pos(self.pos as i128 + off as i128)?,
        };
        self.pos = new_pos;
        Ok(self.pos)
    }
}

/// Copy `src` into the disk at `disk_offset`, refusing to write more than
/// `max_len` bytes.
pub fn write_file_at(disk: &Path, disk_offset: u64, max_len: u64, src: &Path) -> Result<u64> {
    let src_len = std::fs::metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?
        .len();
    if src_len > max_len {
        bail!(
            "{} is {src_len} bytes but only {max_len} bytes are available",
            src.display()
        );
    }
    let mut region = RegionIo::open(disk, disk_offset, max_len)?;
    let mut input =
        File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
    let copied = io::copy(&mut input, &mut region)
        .with_context(|| format!("failed to copy {} into disk", src.display()))?;
    region.sync()?;
    Ok(copied)
}

/// Read `len` bytes of the disk starting at `offset`.
pub fn read_region(disk: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut region = RegionIo::open(disk, offset, len)?;
    let mut out = Vec::with_capacity(len as usize);
    region.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_stay_inside_region() {
        let temp = TempDir::new().unwrap();
        let disk = temp.path().join("disk.img");
        std::fs::File::create(&disk).unwrap().set_len(4096).unwrap();

        let mut region = RegionIo::open(&disk, 1024, 16).unwrap();
        region.write_all(b"0123456789abcdef").unwrap();
        assert!(region.write_all(b"x").is_err());

        let bytes = read_region(&disk, 1024, 16).unwrap();
        assert_eq!(bytes, b"0123456789abcdef");
        assert_eq!(read_region(&disk, 1040, 1).unwrap(), vec![0]);
    }

    #[test]
    fn rejects_oversized_source() {
        let temp = TempDir::new().unwrap();
        let disk = temp.path().join("disk.img");
        std::fs::File::create(&disk).unwrap().set_len(4096).unwrap();
        let src = temp.path().join("blob");
        std::fs::write(&src, vec![1u8; 600]).unwrap();

        assert!(write_file_at(&disk, 0, 512, &src).is_err());
        assert_eq!(write_file_at(&disk, 512, 1024, &src).unwrap(), 600);
        assert_eq!(read_region(&disk, 512, 600).unwrap(), vec![1u8; 600]);
    }

    #[test]
    fn region_outside_disk_is_rejected() {
        let temp = TempDir::new().unwrap();
        let disk = temp.path().join("disk.img");
        std::fs::File::create(&disk).unwrap().set_len(1024).unwrap();
        assert!(RegionIo::open(&disk, 512, 1024).is_err());
    }
}
