//! File-info wrapper
//!
//! Every field is gated by its validity bit: a field whose bit is clear reads
//! as `None`, and a record of type [`FileType::NoFile`] reads as `None` for
//! every field.

use crate::error::BridgeResult;
use crate::table::Ownership;
use chrono::{DateTime, Utc};
use native_host::{FileInfo, FileType, FinfoValid, Pool, PoolRef};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Fields exposed by [`FinfoObject::field`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinfoField {
    FileType,
    Protection,
    User,
    Group,
    Inode,
    Device,
    Nlink,
    Size,
    Csize,
    Atime,
    Mtime,
    Ctime,
    Fname,
    Name,
}

impl FinfoField {
    pub const ALL: [FinfoField; 14] = [
        FinfoField::FileType,
        FinfoField::Protection,
        FinfoField::User,
        FinfoField::Group,
        FinfoField::Inode,
        FinfoField::Device,
        FinfoField::Nlink,
        FinfoField::Size,
        FinfoField::Csize,
        FinfoField::Atime,
        FinfoField::Mtime,
        FinfoField::Ctime,
        FinfoField::Fname,
        FinfoField::Name,
    ];

    /// Bits of which at least one must be valid for the field to be present
    fn validity(self) -> FinfoValid {
        match self {
            FinfoField::FileType => FinfoValid::TYPE,
            FinfoField::Protection => FinfoValid::PROT,
            FinfoField::User => FinfoValid::USER,
            FinfoField::Group => FinfoValid::GROUP,
            FinfoField::Inode => FinfoValid::INODE,
            FinfoField::Device => FinfoValid::DEV,
            FinfoField::Nlink => FinfoValid::NLINK,
            FinfoField::Size => FinfoValid::SIZE,
            FinfoField::Csize => FinfoValid::CSIZE,
            FinfoField::Atime => FinfoValid::ATIME,
            FinfoField::Mtime => FinfoValid::MTIME,
            FinfoField::Ctime => FinfoValid::CTIME,
            FinfoField::Fname => FinfoValid::FNAME,
            FinfoField::Name => FinfoValid::NAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinfoValue {
    FileType(FileType),
    Int(u64),
    Time(DateTime<Utc>),
    Str(String),
}

fn read_field(info: &FileInfo, field: FinfoField) -> Option<FinfoValue> {
    if info.filetype == FileType::NoFile || !info.valid.intersects(field.validity()) {
        return None;
    }
    match field {
        FinfoField::FileType => Some(FinfoValue::FileType(info.filetype)),
        FinfoField::Protection => Some(FinfoValue::Int(u64::from(info.protection))),
        FinfoField::User => Some(FinfoValue::Int(u64::from(info.user))),
        FinfoField::Group => Some(FinfoValue::Int(u64::from(info.group))),
        FinfoField::Inode => Some(FinfoValue::Int(info.inode)),
        FinfoField::Device => Some(FinfoValue::Int(info.device)),
        FinfoField::Nlink => Some(FinfoValue::Int(info.nlink)),
        FinfoField::Size => Some(FinfoValue::Int(info.size)),
        FinfoField::Csize => Some(FinfoValue::Int(info.csize)),
        FinfoField::Atime => info.atime.map(FinfoValue::Time),
        FinfoField::Mtime => info.mtime.map(FinfoValue::Time),
        FinfoField::Ctime => info.ctime.map(FinfoValue::Time),
        FinfoField::Fname => info.fname.clone().map(FinfoValue::Str),
        FinfoField::Name => info.name.clone().map(FinfoValue::Str),
    }
}

struct FinfoInner {
    finfo: PoolRef<FileInfo>,
    ownership: Ownership,
}

/// Reference-counted file-info handle
#[derive(Clone)]
pub struct FinfoObject {
    inner: Arc<FinfoInner>,
}

impl FinfoObject {
    /// Wrap `info` in a pool owned by the wrapper
    pub fn owned(info: FileInfo) -> BridgeResult<Self> {
        let pool = Pool::new("finfo");
        let finfo = pool.alloc(Mutex::new(info))?;
        Ok(Self {
            inner: Arc::new(FinfoInner {
                finfo,
                ownership: Ownership::Owned(pool),
            }),
        })
    }

    /// Wrap a record that lives in someone else's pool
    pub fn borrowed(finfo: PoolRef<FileInfo>) -> Self {
        Self {
            inner: Arc::new(FinfoInner {
                finfo,
                ownership: Ownership::Borrowed,
            }),
        }
    }

    /// Stat `path` into a new owned record
    pub fn stat(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let info = FileInfo::stat(path.as_ref())?;
        Self::owned(info)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.inner.ownership, Ownership::Owned(_))
    }

    /// Copy of the native record
    pub fn snapshot(&self) -> BridgeResult<FileInfo> {
        Ok(self.inner.finfo.get()?.lock().clone())
    }

    /// Gated field read
    pub fn field(&self, field: FinfoField) -> BridgeResult<Option<FinfoValue>> {
        let finfo = self.inner.finfo.get()?;
        let info = finfo.lock();
        Ok(read_field(&info, field))
    }

    fn int(&self, field: FinfoField) -> BridgeResult<Option<u64>> {
        Ok(match self.field(field)? {
            Some(FinfoValue::Int(n)) => Some(n),
            _ => None,
        })
    }

    fn time(&self, field: FinfoField) -> BridgeResult<Option<DateTime<Utc>>> {
        Ok(match self.field(field)? {
            Some(FinfoValue::Time(t)) => Some(t),
            _ => None,
        })
    }

    fn text(&self, field: FinfoField) -> BridgeResult<Option<String>> {
        Ok(match self.field(field)? {
            Some(FinfoValue::Str(s)) => Some(s),
            _ => None,
        })
    }

    pub fn filetype(&self) -> BridgeResult<Option<FileType>> {
        Ok(match self.field(FinfoField::FileType)? {
            Some(FinfoValue::FileType(t)) => Some(t),
            _ => None,
        })
    }

    pub fn protection(&self) -> BridgeResult<Option<u32>> {
        Ok(self.int(FinfoField::Protection)?.map(|n| n as u32))
    }

    pub fn user(&self) -> BridgeResult<Option<u32>> {
        Ok(self.int(FinfoField::User)?.map(|n| n as u32))
    }

    pub fn group(&self) -> BridgeResult<Option<u32>> {
        Ok(self.int(FinfoField::Group)?.map(|n| n as u32))
    }

    pub fn inode(&self) -> BridgeResult<Option<u64>> {
        self.int(FinfoField::Inode)
    }

    pub fn device(&self) -> BridgeResult<Option<u64>> {
        self.int(FinfoField::Device)
    }

    pub fn nlink(&self) -> BridgeResult<Option<u64>> {
        self.int(FinfoField::Nlink)
    }

    pub fn size(&self) -> BridgeResult<Option<u64>> {
        self.int(FinfoField::Size)
    }

    pub fn csize(&self) -> BridgeResult<Option<u64>> {
        self.int(FinfoField::Csize)
    }

    pub fn atime(&self) -> BridgeResult<Option<DateTime<Utc>>> {
        self.time(FinfoField::Atime)
    }

    pub fn mtime(&self) -> BridgeResult<Option<DateTime<Utc>>> {
        self.time(FinfoField::Mtime)
    }

    pub fn ctime(&self) -> BridgeResult<Option<DateTime<Utc>>> {
        self.time(FinfoField::Ctime)
    }

    pub fn fname(&self) -> BridgeResult<Option<String>> {
        self.text(FinfoField::Fname)
    }

    pub fn name(&self) -> BridgeResult<Option<String>> {
        self.text(FinfoField::Name)
    }
}

impl fmt::Debug for FinfoObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinfoObject")
            .field("ownership", &self.inner.ownership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_only_size_bit_set() {
        let info = FileInfo {
            valid: FinfoValid::SIZE,
            filetype: FileType::Regular,
            size: 1234,
            protection: 0o644,
            user: 1000,
            fname: Some("/srv/data.bin".into()),
            name: Some("data.bin".into()),
            ..Default::default()
        };
        let f = FinfoObject::owned(info).unwrap();

        assert_eq!(f.size().unwrap(), Some(1234));
        assert_eq!(f.protection().unwrap(), None);
        assert_eq!(f.fname().unwrap(), None);
        for field in FinfoField::ALL {
            if field != FinfoField::Size {
                assert_eq!(f.field(field).unwrap(), None, "{:?}", field);
            }
        }
    }

    #[test]
    fn test_no_file_is_absent_everywhere() {
        let info = FileInfo {
            valid: FinfoValid::all(),
            filetype: FileType::NoFile,
            size: 10,
            fname: Some("/x".into()),
            ..Default::default()
        };
        let f = FinfoObject::owned(info).unwrap();
        for field in FinfoField::ALL {
            assert_eq!(f.field(field).unwrap(), None, "{:?}", field);
        }
    }

    #[test]
    fn test_stat_populates_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let f = FinfoObject::stat(file.path()).unwrap();
        assert!(f.is_owned());
        assert_eq!(f.filetype().unwrap(), Some(FileType::Regular));
        assert_eq!(f.size().unwrap(), Some(3));
        assert!(f.mtime().unwrap().is_some());
        assert!(f.fname().unwrap().is_some());
    }

    #[test]
    fn test_borrowed_record_follows_pool() {
        let pool = Pool::new("request");
        let native = pool.alloc(Mutex::new(FileInfo::none())).unwrap();
        let f = FinfoObject::borrowed(native);
        assert!(!f.is_owned());
        assert_eq!(f.size().unwrap(), None);

        pool.destroy();
        assert!(f.size().is_err());
    }
}
