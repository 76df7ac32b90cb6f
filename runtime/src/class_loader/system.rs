use crate::class_loader::ClassBytesSource;
use crate::debug_log;
use std::collections::HashMap;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Directory classpath entry. The tree is indexed once up front so lookups
/// never touch the filesystem for names that are not present.
pub struct DirectoryClassSource {
    index: HashMap<String, PathBuf>,
}

impl DirectoryClassSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut index = HashMap::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("class") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&root) {
                let name = relative
                    .with_extension("")
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                index.insert(name, path.to_path_buf());
            }
        }
        debug_log!("indexed {} class files under {:?}", index.len(), root);
        Self { index }
    }
}

impl ClassBytesSource for DirectoryClassSource {
    fn resolve(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.index.get(name)?;
        std::fs::read(path).ok()
    }
}
