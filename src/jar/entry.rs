//! Entry classification for jar archives.

/// Location of the jar manifest.
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Listing that marks a bundled (nested) server jar.
pub const VERSIONS_LIST_PATH: &str = "META-INF/versions.list";

/// Directory that bundle listings resolve their third column against.
pub const VERSIONS_DIR: &str = "META-INF/versions/";

const METADATA_DIR: &str = "META-INF/";
const SIGNATURE_EXTENSIONS: &[&str] = &[".SF", ".RSA", ".EC", ".DSA"];
const CLASS_SUFFIX: &str = ".class";

/// One entry of an archive, classified for merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarEntryRecord {
    pub path: String,
    pub is_directory: bool,
    pub is_class_file: bool,
    pub is_signature_file: bool,
}

impl JarEntryRecord {
    pub fn new(path: impl Into<String>, is_directory: bool) -> Self {
        let path = path.into();
        let is_directory = is_directory || path.ends_with('/');
        Self {
            is_class_file: !is_directory && is_class_file(&path),
            is_signature_file: !is_directory && is_signature_file(&path),
            is_directory,
            path,
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.path == MANIFEST_PATH
    }

    /// Resources are copied verbatim into a merged jar.
    pub fn is_resource(&self) -> bool {
        !self.is_directory && !self.is_class_file && !self.is_manifest() && !self.is_signature_file
    }
}

pub fn is_class_file(path: &str) -> bool {
    path.ends_with(CLASS_SUFFIX)
}

/// Code-signing material: `META-INF/*.{SF,RSA,EC,DSA}`.
pub fn is_signature_file(path: &str) -> bool {
    path.starts_with(METADATA_DIR)
        && SIGNATURE_EXTENSIONS
            .iter()
            .any(|ext| path.ends_with(ext))
}

/// `a/B.class` -> `Some("a/B")`.
pub fn class_name_of(path: &str) -> Option<&str> {
    path.strip_suffix(CLASS_SUFFIX)
}

pub fn class_path_of(class_name: &str) -> String {
    format!("{class_name}{CLASS_SUFFIX}")
}
