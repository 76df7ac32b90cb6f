use crate::debug_log;
use crate::error::JvmError;
use crate::throw_exception;

pub mod system;

/// The classpath provider seam. Archive scanning, zip handling and any
/// other I/O live behind this; the core only ever asks for bytes.
pub trait ClassBytesSource: Send + Sync {
    /// `name` is the internal binary name, e.g. `java/lang/Object`.
    fn resolve(&self, name: &str) -> Option<Vec<u8>>;
}

/// In-memory source, the unit-test workhorse.
pub struct MapClassSource {
    classes: std::collections::HashMap<String, Vec<u8>>,
}

impl MapClassSource {
    pub fn new() -> Self {
        Self {
            classes: std::collections::HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.classes.insert(name.into(), bytes);
        self
    }
}

impl Default for MapClassSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassBytesSource for MapClassSource {
    fn resolve(&self, name: &str) -> Option<Vec<u8>> {
        self.classes.get(name).cloned()
    }
}

/// The bootstrap loader: walks its sources in order, first hit wins.
pub struct BootstrapClassLoader {
    sources: Vec<Box<dyn ClassBytesSource>>,
}

impl BootstrapClassLoader {
    pub fn new(sources: Vec<Box<dyn ClassBytesSource>>) -> Self {
        Self { sources }
    }

    pub fn load(&self, name: &str) -> Result<Vec<u8>, JvmError> {
        for source in &self.sources {
            if let Some(bytes) = source.resolve(name) {
                debug_log!("bytecode of {:?} located on the bootstrap path", name);
                return Ok(bytes);
            }
        }
        throw_exception!(NoClassDefFoundError, "{}", name.replace('/', "."))
    }
}

/// Rejects names the loader must not even attempt: empty segments, stray
/// separators, or malformed array descriptors.
pub fn is_valid_class_name(name: &str) -> bool {
    let element = name.trim_start_matches('[');
    if element.len() < name.len() {
        // Array descriptor: element must itself be well formed.
        return match element.as_bytes() {
            [b'L', .., b';'] => is_valid_binary_name(&element[1..element.len() - 1]),
            [b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D'] => true,
            _ => false,
        };
    }
    is_valid_binary_name(name)
}

fn is_valid_binary_name(name: &str) -> bool {
    !name.is_empty() && name.split('/').all(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_name_validation() {
        assert!(is_valid_class_name("java/lang/Object"));
        assert!(is_valid_class_name("[I"));
        assert!(is_valid_class_name("[[Ljava/lang/String;"));
        assert!(is_valid_class_name("Main"));
        assert!(!is_valid_class_name(""));
        assert!(!is_valid_class_name("/leading"));
        assert!(!is_valid_class_name("trailing/"));
        assert!(!is_valid_class_name("a//b"));
        assert!(!is_valid_class_name("[Q"));
        assert!(!is_valid_class_name("[L;"));
    }

    #[test]
    fn first_source_wins() {
        let mut a = MapClassSource::new();
        a.insert("X", vec![1]);
        let mut b = MapClassSource::new();
        b.insert("X", vec![2]);
        let loader = BootstrapClassLoader::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(loader.load("X").unwrap(), vec![1]);
        assert!(loader.load("Y").is_err());
    }
}
