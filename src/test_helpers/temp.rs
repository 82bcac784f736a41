use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Scratch directory for firmware images; removed on drop.
pub struct TestContext {
    dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Absolute path of `name` inside the scratch directory. The file need not exist.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a text file, e.g. an Intel HEX image or a manifest.
    pub fn create_file(&self, name: &str, content: &str) -> PathBuf {
        self.create_file_bytes(name, content.as_bytes())
    }

    pub fn create_file_bytes(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&path, content).expect("Failed to write image");
        path
    }

    /// Zero-length file, for empty image checks.
    pub fn touch(&self, name: &str) -> PathBuf {
        self.create_file_bytes(name, &[])
    }

    /// Raw application image of `len` bytes with a recognisable pattern.
    pub fn create_image(&self, name: &str, len: usize) -> PathBuf {
        let image: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        self.create_file_bytes(name, &image)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
