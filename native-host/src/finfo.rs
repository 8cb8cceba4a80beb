//! Native file information record
//!
//! Fields are only meaningful when their bit is set in [`FileInfo::valid`].

use crate::error::NativeResult;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use std::path::Path;

bitflags! {
	/// Which fields of a [`FileInfo`] hold real data
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct FinfoValid: u32 {
		const LINK = 0x0000_0001;
		const MTIME = 0x0000_0010;
		const CTIME = 0x0000_0020;
		const ATIME = 0x0000_0040;
		const SIZE = 0x0000_0100;
		const CSIZE = 0x0000_0200;
		const DEV = 0x0000_1000;
		const INODE = 0x0000_2000;
		const NLINK = 0x0000_4000;
		const TYPE = 0x0000_8000;
		const USER = 0x0001_0000;
		const GROUP = 0x0002_0000;
		const UPROT = 0x0010_0000;
		const GPROT = 0x0020_0000;
		const WPROT = 0x0040_0000;
		const ICASE = 0x0100_0000;
		const NAME = 0x0200_0000;
		const FNAME = 0x0400_0000;

		const PROT = Self::UPROT.bits() | Self::GPROT.bits() | Self::WPROT.bits();
		const OWNER = Self::USER.bits() | Self::GROUP.bits();
		const IDENT = Self::DEV.bits() | Self::INODE.bits();
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
	/// No file; every field of the record is absent
	#[default]
	NoFile,
	Regular,
	Directory,
	CharDevice,
	BlockDevice,
	Pipe,
	Link,
	Socket,
	Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
	pub valid: FinfoValid,
	pub filetype: FileType,
	pub protection: u32,
	pub user: u32,
	pub group: u32,
	pub inode: u64,
	pub device: u64,
	pub nlink: u64,
	pub size: u64,
	pub csize: u64,
	pub atime: Option<DateTime<Utc>>,
	pub mtime: Option<DateTime<Utc>>,
	pub ctime: Option<DateTime<Utc>>,
	pub fname: Option<String>,
	pub name: Option<String>,
}

impl FileInfo {
	/// Record describing "no file"
	pub fn none() -> Self {
		Self::default()
	}

	/// Stat `path` without following a final symlink
	pub fn stat(path: &Path) -> NativeResult<Self> {
		let meta = std::fs::symlink_metadata(path)?;
		let ft = meta.file_type();

		let mut info = FileInfo {
			valid: FinfoValid::TYPE | FinfoValid::SIZE | FinfoValid::NAME | FinfoValid::FNAME,
			filetype: file_type_of(&ft),
			size: meta.len(),
			fname: Some(path.to_string_lossy().into_owned()),
			name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
			..Default::default()
		};

		if let Ok(t) = meta.modified() {
			info.mtime = Some(t.into());
			info.valid |= FinfoValid::MTIME;
		}
		if let Ok(t) = meta.accessed() {
			info.atime = Some(t.into());
			info.valid |= FinfoValid::ATIME;
		}

		#[cfg(unix)]
		{
			use std::os::unix::fs::MetadataExt;
			info.protection = meta.mode() & 0o7777;
			info.user = meta.uid();
			info.group = meta.gid();
			info.inode = meta.ino();
			info.device = meta.dev();
			info.nlink = meta.nlink();
			info.csize = meta.blocks() * 512;
			info.ctime = DateTime::from_timestamp(meta.ctime(), 0);
			info.valid |= FinfoValid::PROT
				| FinfoValid::OWNER
				| FinfoValid::IDENT
				| FinfoValid::NLINK
				| FinfoValid::CSIZE
				| FinfoValid::CTIME;
		}

		Ok(info)
	}
}

fn file_type_of(ft: &std::fs::FileType) -> FileType {
	if ft.is_file() {
		return FileType::Regular;
	}
	if ft.is_dir() {
		return FileType::Directory;
	}
	if ft.is_symlink() {
		return FileType::Link;
	}
	#[cfg(unix)]
	{
		use std::os::unix::fs::FileTypeExt;
		if ft.is_char_device() {
			return FileType::CharDevice;
		}
		if ft.is_block_device() {
			return FileType::BlockDevice;
		}
		if ft.is_fifo() {
			return FileType::Pipe;
		}
		if ft.is_socket() {
			return FileType::Socket;
		}
	}
	FileType::Unknown
}
