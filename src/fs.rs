//! The flat file table stored on disk after the kernel.
//!
//! Layout, all integers little-endian:
//! ```text
//! 0      "FS"
//! 2      u16 file count
//! 4      count * { name: [u8; 16] NUL padded, size: u32, offset: u32 }
//! ...    file data; `offset` is relative to the end of the headers
//! ```

use core::convert::TryFrom;
use core::fmt;

/// Leading bytes of a valid image.
pub const FS_MAGIC: &[u8; 2] = b"FS";

/// Bytes reserved for a file name.
pub const NAME_LEN: usize = 16;

const HEADER_LEN: usize = NAME_LEN + 4 + 4;
const TABLE_START: usize = 4;

/// Why an image could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
  /// The image does not start with [FS_MAGIC].
  BadMagic,
  /// The headers run past the end of the image.
  TruncatedTable {
    /// Files announced by the count field.
    count: u16,
  },
  /// A file's data lies outside the image.
  FileOutOfBounds {
    /// Index of the header.
    index: u16,
  },
  /// A name does not fit in [NAME_LEN] bytes.
  NameTooLong {
    /// Index of the file.
    index: u16,
  },
  /// More files than the count field holds.
  TooManyFiles,
  /// The output buffer cannot hold the image.
  ImageTooSmall {
    /// Bytes the image needs.
    needed: usize,
  },
}

impl fmt::Display for FsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FsError::BadMagic => write!(f, "file system magic mismatch"),
      FsError::TruncatedTable { count } => {
        write!(f, "table of {} files does not fit in the image", count)
      }
      FsError::FileOutOfBounds { index } => write!(f, "file {} lies outside the image", index),
      FsError::NameTooLong { index } => {
        write!(f, "name of file {} is longer than {} bytes", index, NAME_LEN)
      }
      FsError::TooManyFiles => write!(f, "more than {} files", u16::MAX),
      FsError::ImageTooSmall { needed } => write!(f, "image needs {} bytes", needed),
    }
  }
}

/// One file of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct File<'a> {
  name: &'a [u8],
  data: &'a [u8],
}

impl<'a> File<'a> {
  /// Name without the NUL padding.
  pub fn name(&self) -> &'a [u8] {
    self.name
  }

  /// File contents.
  pub fn data(&self) -> &'a [u8] {
    self.data
  }
}

/// A validated view over an image.
#[derive(Debug, Clone, Copy)]
pub struct FileTable<'a> {
  image: &'a [u8],
  count: u16,
}

impl<'a> FileTable<'a> {
  /// Check the magic and that every header and every file lies inside
  /// `image`.
  pub fn parse(image: &'a [u8]) -> Result<Self, FsError> {
    if image.len() < TABLE_START || &image[..2] != FS_MAGIC {
      return Err(FsError::BadMagic);
    }
    let count = u16::from_le_bytes([image[2], image[3]]);
    if image.len() < TABLE_START + usize::from(count) * HEADER_LEN {
      return Err(FsError::TruncatedTable { count });
    }

    let table = FileTable { image, count };
    for index in 0..count {
      table.file(index)?;
    }
    Ok(table)
  }

  /// Number of files.
  pub fn len(&self) -> usize {
    usize::from(self.count)
  }

  /// Whether the table lists no files.
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  /// Every file, in table order.
  pub fn iter(&self) -> impl Iterator<Item = File<'a>> + '_ {
    (0..self.count).filter_map(move |index| self.file(index).ok())
  }

  /// The first file called `name`.
  pub fn find(&self, name: &str) -> Option<File<'a>> {
    self.iter().find(|file| file.name() == name.as_bytes())
  }

  fn data_start(&self) -> usize {
    TABLE_START + self.len() * HEADER_LEN
  }

  fn file(&self, index: u16) -> Result<File<'a>, FsError> {
    let image: &'a [u8] = self.image;
    let at = TABLE_START + usize::from(index) * HEADER_LEN;
    let header = &image[at..at + HEADER_LEN];

    let raw_name = &header[..NAME_LEN];
    let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let size = read_u32(&header[NAME_LEN..]) as usize;
    let offset = read_u32(&header[NAME_LEN + 4..]) as usize;

    let start = self
      .data_start()
      .checked_add(offset)
      .ok_or(FsError::FileOutOfBounds { index })?;
    let data = start
      .checked_add(size)
      .and_then(|end| image.get(start..end))
      .ok_or(FsError::FileOutOfBounds { index })?;

    Ok(File {
      name: &raw_name[..name_len],
      data,
    })
  }
}

/// Lay `files` out as an image at the front of `image` and return its
/// length. The rest of `image` is left untouched.
pub fn write_image(files: &[(&str, &[u8])], image: &mut [u8]) -> Result<usize, FsError> {
  let count = u16::try_from(files.len()).map_err(|_| FsError::TooManyFiles)?;
  let data_start = TABLE_START + files.len() * HEADER_LEN;
  let needed = data_start + files.iter().map(|(_, data)| data.len()).sum::<usize>();
  if image.len() < needed {
    return Err(FsError::ImageTooSmall { needed });
  }

  image[..2].copy_from_slice(FS_MAGIC);
  image[2..TABLE_START].copy_from_slice(&count.to_le_bytes());
  let mut offset = 0;
  for (index, (name, data)) in (0..count).zip(files) {
    if name.len() > NAME_LEN {
      return Err(FsError::NameTooLong { index });
    }
    let header = &mut image[TABLE_START + usize::from(index) * HEADER_LEN..][..HEADER_LEN];
    header[..NAME_LEN].fill(0);
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[NAME_LEN..NAME_LEN + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    header[NAME_LEN + 4..].copy_from_slice(&(offset as u32).to_le_bytes());

    image[data_start + offset..][..data.len()].copy_from_slice(data);
    offset += data.len();
  }
  Ok(needed)
}

fn read_u32(bytes: &[u8]) -> u32 {
  u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
