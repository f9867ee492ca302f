// tests/common/mod.rs

//! Shared test utilities: a synthetic APT repository and an in-memory
//! remote transport.

#![allow(dead_code)]

use async_trait::async_trait;
use debmirror::hash::hash_bytes;
use debmirror::repository::Fetched;
use debmirror::{Error, HashAlgorithm, Result, Transport};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub const DATE_1: &str = "Sat, 01 Jun 2024 10:00:00 UTC";
pub const DATE_2: &str = "Sun, 02 Jun 2024 10:00:00 UTC";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}

fn md5(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Md5, data)
}

/// A `.deb` published in the fake repository
#[derive(Clone)]
pub struct FakePackage {
    pub name: String,
    pub data: Vec<u8>,
    architecture: String,
    declared_size: Option<u64>,
    filename: Option<String>,
    publish_file: bool,
}

impl FakePackage {
    pub fn new(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_vec(),
            architecture: "amd64".to_string(),
            declared_size: None,
            filename: None,
            publish_file: true,
        }
    }

    /// `all` packages are listed in every architecture's index
    pub fn architecture(mut self, arch: &str) -> Self {
        self.architecture = arch.to_string();
        self
    }

    /// Size written into the Packages stanza instead of the real one
    pub fn declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    /// List the package without publishing its file
    pub fn missing(mut self) -> Self {
        self.publish_file = false;
        self
    }

    pub fn pool_path(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            let first = &self.name[..1];
            format!("pool/main/{first}/{0}/{0}_1.0_{1}.deb", self.name, self.architecture)
        })
    }

    fn stanza(&self) -> String {
        format!(
            "Package: {name}\nArchitecture: {arch}\nVersion: 1.0\nFilename: {filename}\nSize: {size}\nMD5sum: {md5}\nSHA256: {sha256}\nDescription: test package {name}\n\n",
            name = self.name,
            arch = self.architecture,
            filename = self.pool_path(),
            size = self.declared_size.unwrap_or(self.data.len() as u64),
            md5 = md5(&self.data),
            sha256 = sha256(&self.data),
        )
    }
}

/// Files of a synthetic repository keyed by path relative to its root
#[derive(Default, Clone)]
pub struct RepoBuilder {
    files: BTreeMap<String, Vec<u8>>,
}

impl RepoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    fn put(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    /// Publish a distribution with one component (`main`) and one
    /// architecture (`amd64`)
    ///
    /// The manifest lists `Packages.gz`, `Contents-amd64.gz`, the i18n
    /// `Index` and `Translation-en`; the Index additionally lists
    /// `Translation-de`, which the manifest does not.
    pub fn dist(
        &mut self,
        dist: &str,
        date: &str,
        packages: &[FakePackage],
        by_hash: bool,
    ) -> &mut Self {
        self.dist_for_architectures(dist, date, &["amd64"], packages, by_hash)
    }

    /// Publish a distribution with one `binary-<arch>/Packages.gz` and one
    /// `Contents-<arch>.gz` per architecture
    pub fn dist_for_architectures(
        &mut self,
        dist: &str,
        date: &str,
        architectures: &[&str],
        packages: &[FakePackage],
        by_hash: bool,
    ) -> &mut Self {
        let base = format!("dists/{dist}");

        let mut indices: Vec<(String, Vec<u8>)> = Vec::new();
        for arch in architectures {
            let mut packages_text = String::new();
            let mut contents_text = String::new();
            for package in packages
                .iter()
                .filter(|p| p.architecture == *arch || p.architecture == "all")
            {
                packages_text.push_str(&package.stanza());
                contents_text.push_str(&format!(
                    "usr/share/doc/{0}/copyright    misc/{0}\n",
                    package.name
                ));
            }
            indices.push((
                format!("main/binary-{arch}/Packages.gz"),
                gzip(packages_text.as_bytes()),
            ));
            indices.push((format!("Contents-{arch}.gz"), gzip(contents_text.as_bytes())));
        }
        for package in packages.iter().filter(|p| p.publish_file) {
            self.put(&package.pool_path(), package.data.clone());
        }

        let translation_en = b"Package: x\nDescription-md5: 0\nDescription-en: x\n".to_vec();
        let translation_de = b"Package: x\nDescription-md5: 0\nDescription-de: x\n".to_vec();
        let i18n_index = format!(
            "SHA256:\n {} {} Translation-en\n {} {} Translation-de\n",
            sha256(&translation_en),
            translation_en.len(),
            sha256(&translation_de),
            translation_de.len()
        )
        .into_bytes();

        indices.push(("main/i18n/Index".to_string(), i18n_index));
        indices.push(("main/i18n/Translation-en".to_string(), translation_en));

        let mut release = format!(
            "Origin: Test\nLabel: Test\nSuite: {dist}\nCodename: {dist}\nDate: {date}\nArchitectures: {}\nComponents: main\nDescription: Test repository\n",
            architectures.join(" ")
        );
        if by_hash {
            release.push_str("Acquire-By-Hash: yes\n");
        }
        release.push_str("MD5Sum:\n");
        for (path, data) in &indices {
            release.push_str(&format!(" {} {} {}\n", md5(data), data.len(), path));
        }
        release.push_str("SHA256:\n");
        for (path, data) in &indices {
            release.push_str(&format!(" {} {} {}\n", sha256(data), data.len(), path));
        }

        for (path, data) in indices {
            if by_hash {
                let dir = path.rsplit_once('/').map(|(d, _)| format!("{d}/")).unwrap_or_default();
                self.put(
                    &format!("{base}/{dir}by-hash/SHA256/{}", sha256(&data)),
                    data.clone(),
                );
            }
            self.put(&format!("{base}/{path}"), data);
        }
        self.put(&format!("{base}/Release"), release.into_bytes());
        self.put(
            &format!("{base}/main/i18n/Translation-de"),
            translation_de,
        );
        self
    }

    /// Remove a file from the published tree
    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.files.remove(path);
        self
    }

    pub fn write_to(&self, root: &Path) {
        for (path, data) in &self.files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, data).unwrap();
        }
    }
}

/// Remote-looking transport serving a [`RepoBuilder`] from memory
pub struct MemoryTransport {
    files: BTreeMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new(repo: &RepoBuilder) -> Self {
        Self {
            files: repo.files().clone(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Locators fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, locator: &str) -> Result<Fetched> {
        let data = self
            .files
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(locator.to_string()))?;
        self.fetched.lock().unwrap().push(locator.to_string());

        Ok(Fetched {
            content_length: Some(data.len() as u64),
            body: Box::pin(std::io::Cursor::new(data)),
            content_type: None,
        })
    }

    async fn exists(&self, locator: &str) -> bool {
        self.files.contains_key(locator)
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "memory"
    }
}
