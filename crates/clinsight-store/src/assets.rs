//! Image path resolution across CheXpert disk layouts.
//!
//! Index paths look like `CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg`,
//! but the images may have been unpacked with or without the dataset directory,
//! or with the split directories at the root.

use std::path::PathBuf;

use crate::StoreError;

const DATASET_DIR: &str = "CheXpert-v1.0-small";

/// Resolves index-relative image paths against the known disk layouts.
#[derive(Debug, Clone)]
pub struct ImageLocator {
    root: PathBuf,
    img_data: PathBuf,
}

impl ImageLocator {
    /// Locator with the same directory for both the dataset root and image data.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            img_data: root.clone(),
            root,
        }
    }

    /// Locator with a separate image data directory.
    pub fn with_img_data(mut self, img_data: impl Into<PathBuf>) -> Self {
        self.img_data = img_data.into();
        self
    }

    /// Directories searched, in order.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.root.clone(), self.root.join(DATASET_DIR)];
        if let Some(parent) = self.root.parent() {
            roots.push(parent.to_path_buf());
        }
        roots.push(self.img_data.clone());
        if let Some(parent) = self.img_data.parent() {
            roots.push(parent.to_path_buf());
        }
        roots
    }

    /// Resolve a relative image path to an existing file.
    ///
    /// Fails with [`StoreError::MissingAsset`] carrying the most likely path
    /// and every searched root.
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf, StoreError> {
        let normalized = rel_path.replace('\\', "/");
        let s0 = normalized.trim_start_matches('/');

        let mut variants: Vec<String> = vec![s0.to_string()];
        let candidates = [
            s0.replacen(&format!("{DATASET_DIR}/"), "", 1),
            s0.replacen(&format!("{DATASET_DIR}/train/"), "train/", 1),
            s0.replacen(&format!("{DATASET_DIR}/valid/"), "valid/", 1),
        ];
        for v in candidates {
            if !variants.contains(&v) {
                variants.push(v);
            }
        }

        let roots = self.search_roots();
        for base in &roots {
            for v in &variants {
                let p = base.join(v);
                if p.is_file() {
                    return Ok(p);
                }
            }
        }

        Err(StoreError::MissingAsset {
            rel_path: rel_path.to_string(),
            attempted: self.root.join(s0),
            roots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const REL: &str = "CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg";

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"jpg").unwrap();
    }

    #[test]
    fn resolves_full_layout() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join(REL);
        touch(&expected);

        let locator = ImageLocator::new(dir.path());
        assert_eq!(locator.resolve(REL).unwrap(), expected);
    }

    #[test]
    fn resolves_without_dataset_dir() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("train/patient00001/study1/view1_frontal.jpg");
        touch(&expected);

        let locator = ImageLocator::new(dir.path());
        assert_eq!(locator.resolve(REL).unwrap(), expected);
    }

    #[test]
    fn resolves_from_parent_of_root() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join(REL);
        touch(&expected);

        // Root points one level too deep.
        let locator = ImageLocator::new(dir.path().join("raw"));
        assert_eq!(locator.resolve(REL).unwrap(), expected);
    }

    #[test]
    fn resolves_windows_separators() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join(REL);
        touch(&expected);

        let locator = ImageLocator::new(dir.path());
        let windows = REL.replace('/', "\\");
        assert_eq!(locator.resolve(&windows).unwrap(), expected);
    }

    #[test]
    fn resolves_under_separate_img_data() {
        let root = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let expected = images.path().join("valid/patient00001/study1/view1_frontal.jpg");
        touch(&expected);

        let locator = ImageLocator::new(root.path()).with_img_data(images.path());
        let rel = "CheXpert-v1.0-small/valid/patient00001/study1/view1_frontal.jpg";
        assert_eq!(locator.resolve(rel).unwrap(), expected);
    }

    #[test]
    fn missing_reports_attempt_and_roots() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ImageLocator::new(dir.path());
        let err = locator.resolve(REL).unwrap_err();
        match &err {
            StoreError::MissingAsset {
                rel_path,
                attempted,
                roots,
            } => {
                assert_eq!(rel_path, REL);
                assert_eq!(attempted, &dir.path().join(REL));
                assert!(roots.contains(&dir.path().to_path_buf()));
            }
            other => panic!("expected MissingAsset, got {other:?}"),
        }
        assert!(err.to_string().contains("view1_frontal.jpg"));
    }
}
