use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a multiple of 20
        if metainfo.info.pieces.is_empty() || metainfo.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidPieces);
        }
        Ok(metainfo)
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Builds the file system structure the torrent's download will have,
    /// relative to the download directory.
    pub(crate) fn fs_structure(&self) -> Result<FsStructure> {
        if let Some(len) = self.info.len {
            Ok(FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len,
                torrent_offset: 0,
            }))
        } else if let Some(files) = &self.info.files {
            if files.is_empty() {
                return Err(Error::InvalidDownloadPath);
            }
            let root = PathBuf::from(&self.info.name);
            let mut torrent_offset = 0;
            let mut file_infos = Vec::with_capacity(files.len());
            for file in files.iter() {
                let mut path = root.clone();
                for component in file.path.iter() {
                    // reject path components that would escape the download
                    // root
                    if component.is_empty()
                        || component == "."
                        || component == ".."
                        || component.contains(std::path::MAIN_SEPARATOR)
                    {
                        return Err(Error::InvalidDownloadPath);
                    }
                    path.push(component);
                }
                file_infos.push(FileInfo {
                    path,
                    len: file.len,
                    torrent_offset,
                });
                torrent_offset += file.len;
            }
            Ok(FsStructure::Archive { files: file_infos })
        } else {
            Err(Error::InvalidDownloadPath)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_len: u64,
    #[serde(rename = "length")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    #[serde(rename = "length")]
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Metainfo {
        Metainfo {
            info: Info {
                name: "download".into(),
                pieces: vec![0; 3 * 20],
                piece_len: 0x4000,
                len: Some(3 * 0x4000),
                files: None,
                private: None,
            },
            announce: Some("udp://tracker:1337".into()),
        }
    }

    #[test]
    fn test_piece_count() {
        assert_eq!(single_file_metainfo().piece_count(), 3);
    }

    #[test]
    fn test_single_file_fs_structure() {
        let structure = single_file_metainfo().fs_structure().unwrap();
        match structure {
            FsStructure::File(file) => {
                assert_eq!(file.path, PathBuf::from("download"));
                assert_eq!(file.len, 3 * 0x4000);
                assert_eq!(file.torrent_offset, 0);
            }
            _ => panic!("expected single file structure"),
        }
    }

    #[test]
    fn test_archive_fs_structure() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.len = None;
        metainfo.info.files = Some(vec![
            File {
                path: vec!["a".into()],
                len: 100,
            },
            File {
                path: vec!["sub".into(), "b".into()],
                len: 200,
            },
        ]);

        let structure = metainfo.fs_structure().unwrap();
        let files = structure.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, PathBuf::from("download/a"));
        assert_eq!(files[0].torrent_offset, 0);
        assert_eq!(files[1].path, PathBuf::from("download/sub/b"));
        assert_eq!(files[1].torrent_offset, 100);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.len = None;
        metainfo.info.files = Some(vec![File {
            path: vec!["..".into(), "evil".into()],
            len: 100,
        }]);
        assert!(metainfo.fs_structure().is_err());
    }

    #[test]
    fn test_rejects_invalid_pieces() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.pieces = vec![0; 19];
        let encoded = serde_bencode::to_bytes(&metainfo.info).unwrap();
        // wrap into a metainfo dict by hand
        let mut buf = b"d4:info".to_vec();
        buf.extend_from_slice(&encoded);
        buf.push(b'e');
        assert!(Metainfo::from_bytes(&buf).is_err());
    }
}
