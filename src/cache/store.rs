//! 永続ストアアダプタ
//!
//! キャッシュレコードを保持する不透明なバイトKVストア。実体はsledで、
//! エントリ単位のクラッシュ耐性を持ちます。

use crate::error::Result;
use std::path::Path;

/// バイトKVストア
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// ストアを開く
    ///
    /// 前回異常終了時に残ったロックファイルを先に取り除きます。
    pub fn open(path: &Path) -> Result<Store> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let _ = std::fs::remove_file(Path::new(&lock_path));
        let db = sled::open(path)?;
        Ok(Store { db })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// ディスク上のファイルサイズ（バイト）
    pub fn file_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// バッファをディスクへフラッシュして閉じる
    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
