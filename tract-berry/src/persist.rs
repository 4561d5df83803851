//! `bincode` + zlib 压缩的持久化.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// 持久化错误.
#[derive(Debug)]
pub enum PersistError {
    /// 文件读写错误.
    Io(std::io::Error),

    /// 编解码错误.
    Bincode(bincode::Error),

    /// 数据已读出但内容不合法.
    Invalid(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Bincode(e) => write!(f, "bincode error: {e}"),
            Self::Invalid(reason) => write!(f, "invalid content: {reason}"),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Bincode(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<bincode::Error> for PersistError {
    fn from(e: bincode::Error) -> Self {
        Self::Bincode(e)
    }
}

/// 压缩写入 `value`.
pub(crate) fn save<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<(), PersistError> {
    let file = BufWriter::new(File::create(path)?);
    let mut e = ZlibEncoder::new(file, Compression::best());
    bincode::serialize_into(&mut e, value)?;
    e.finish()?.flush()?;
    Ok(())
}

/// 读出 [`save`] 写入的值.
pub(crate) fn load<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, PersistError> {
    let d = ZlibDecoder::new(BufReader::new(File::open(path)?));
    Ok(bincode::deserialize_from(d)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FiberBundle;
    use crate::{Geometry, Vec3};

    fn temp_file(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tract-berry-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_bundle_round_trip() {
        let mut b = FiberBundle::with_geometry(Geometry::isotropic((4, 4, 4), 2.0).unwrap());
        b.push(&[Vec3::zeros(), Vec3::new(1.0, 2.0, 3.0)]);
        b.push(&[Vec3::x(), Vec3::y(), Vec3::z()]);
        b.set_weight(1, 0.25);
        b.color_by_orientation();

        let path = temp_file("bundle.bin");
        b.save(&path).unwrap();
        let back = FiberBundle::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let path = temp_file("garbage.bin");
        std::fs::write(&path, b"not a zlib stream").unwrap();
        let r = load::<FiberBundle, _>(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(r.is_err());
    }
}
