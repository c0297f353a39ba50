//! 청크 저장소
//!
//! 전송 ID 단위(메타데이터)와 (전송 ID, 청크 인덱스) 단위로 바이트를 저장.
//! 재전송 시 다시 분할하지 않고 저장된 청크를 그대로 읽어 보냄

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::chunk::ChunkIndex;
use crate::{Error, Result};

/// 메타데이터 키
pub fn metadata_key(transfer_id: &str) -> String {
    format!("{}/meta", transfer_id)
}

/// 청크 키
pub fn chunk_key(transfer_id: &str, index: ChunkIndex) -> String {
    format!("{}/{:010}", transfer_id, index)
}

/// 전송 하나에 속한 모든 키의 접두사
pub fn transfer_prefix(transfer_id: &str) -> String {
    format!("{}/", transfer_id)
}

/// 바이트 저장소 인터페이스
///
/// 구현체는 프로세스 재시작 후에도 값이 유지되어야 함 (메모리 구현은 테스트용)
pub trait ChunkStore: Send + Sync {
    /// 값 저장 (덮어쓰기)
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// 값 조회
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 접두사로 시작하는 모든 키 삭제, 삭제한 개수 반환
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// 메모리 저장소
#[derive(Default)]
pub struct MemoryChunkStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 항목 수
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// 접두사로 시작하는 키 목록
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// 파일 저장소
///
/// 키 하나가 파일 하나. 파일 이름은 키의 hex 인코딩
///
/// hex는 바이트마다 두 글자로 고정되어 키가 다르면 이름도 다르고,
/// 키 접두사는 그대로 파일 이름 접두사가 됨
pub struct FileChunkStore {
    root: PathBuf,
}

impl FileChunkStore {
    /// 디렉터리를 열거나 생성
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn encode_key(key: &str) -> Result<String> {
        if key.is_empty()
            || key.contains("..")
            || key.contains('\\')
            || key
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.')))
        {
            return Err(Error::Storage(format!("허용되지 않는 키: {:?}", key)));
        }
        Ok(hex::encode(key))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::encode_key(key)?))
    }
}

impl ChunkStore for FileChunkStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!("{}.tmp", Self::encode_key(key)?));

        // 임시 파일에 쓴 뒤 rename (중간 상태 노출 방지)
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let encoded = Self::encode_key(prefix)?;
        let mut removed = 0;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&encoded) && !name.ends_with(".tmp") {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}
