//! GP4 project model and writer.
//!
//! A GP4 file describes the source tree a package was built from: volume
//! metadata, the extracted files, and the directory skeleton. Only the
//! subset the exporter emits is modeled here.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Volume type, derived from the package content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    App,
    Patch,
    AcData,
    AcNodata,
}

impl VolumeType {
    fn name(self) -> &'static str {
        match self {
            Self::App => "pkg_ps4_app",
            Self::Patch => "pkg_ps4_patch",
            Self::AcData => "pkg_ps4_ac_data",
            Self::AcNodata => "pkg_ps4_ac_nodata",
        }
    }
}

/// One exported file.
pub struct ProjectFile {
    /// Path inside the package image.
    pub targ_path: String,
    /// Path of the extracted copy, relative to the project root.
    pub orig_path: String,
}

/// An in-memory GP4 project.
pub struct Project {
    volume_type: VolumeType,
    /// Volume timestamp, `YYYY-MM-DD HH:MM:SS` UTC.
    volume_ts: String,
    content_id: String,
    passcode: String,
    storage_type: String,
    app_type: String,
    creation_date: String,
    entitlement_key: Option<String>,
    files: Vec<ProjectFile>,
    dirs: Vec<String>,
}

impl Project {
    pub fn new(volume_type: VolumeType, content_id: &str, passcode: &str) -> Self {
        let (storage_type, app_type) = match volume_type {
            VolumeType::App => ("digital50", "full"),
            VolumeType::Patch => ("digital25", "full"),
            VolumeType::AcData | VolumeType::AcNodata => ("digital25", ""),
        };

        Self {
            volume_type,
            volume_ts: String::new(),
            content_id: content_id.to_owned(),
            passcode: passcode.to_owned(),
            storage_type: storage_type.to_owned(),
            app_type: app_type.to_owned(),
            creation_date: String::new(),
            entitlement_key: None,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    pub fn volume_type(&self) -> VolumeType {
        self.volume_type
    }

    pub fn set_volume_timestamp(&mut self, ts: &str) {
        self.volume_ts = ts.to_owned();
    }

    pub fn set_creation_date(&mut self, date: &str) {
        self.creation_date = date.to_owned();
    }

    pub fn set_entitlement_key(&mut self, key: &str) {
        self.entitlement_key = Some(key.to_owned());
    }

    /// Registers an exported file. Paths use `/` separators and no leading
    /// slash.
    pub fn add_file(&mut self, targ_path: &str, orig_path: &str) {
        self.files.push(ProjectFile {
            targ_path: targ_path.to_owned(),
            orig_path: orig_path.to_owned(),
        });
    }

    /// Registers a directory for the rootdir skeleton.
    pub fn add_dir(&mut self, path: &str) {
        self.dirs.push(path.to_owned());
    }

    pub fn files(&self) -> &[ProjectFile] {
        &self.files
    }

    pub fn dirs(&self) -> &[String] {
        &self.dirs
    }

    /// Writes the project as GP4 XML.
    pub fn write<W: Write>(&self, mut out: W) -> Result<(), WriteError> {
        let mut xml = String::new();

        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
        xml.push_str("<psproject fmt=\"gp4\" version=\"1000\">\n");
        xml.push_str("  <volume>\n");

        writeln!(xml, "    <volume_type>{}</volume_type>", self.volume_type.name()).unwrap();
        writeln!(xml, "    <volume_ts>{}</volume_ts>", escape(&self.volume_ts)).unwrap();

        xml.push_str("    <package");
        write_attr(&mut xml, "content_id", &self.content_id);
        write_attr(&mut xml, "passcode", &self.passcode);

        if let Some(key) = &self.entitlement_key {
            write_attr(&mut xml, "entitlement_key", key);
        }

        write_attr(&mut xml, "storage_type", &self.storage_type);

        if !self.app_type.is_empty() {
            write_attr(&mut xml, "app_type", &self.app_type);
        }

        if !self.creation_date.is_empty() {
            write_attr(&mut xml, "c_date", &self.creation_date);
        }

        xml.push_str("/>\n");
        xml.push_str("  </volume>\n");

        // Files.
        xml.push_str("  <files img_no=\"0\">\n");

        for file in &self.files {
            xml.push_str("    <file");
            write_attr(&mut xml, "targ_path", &file.targ_path);
            write_attr(&mut xml, "orig_path", &file.orig_path);
            xml.push_str("/>\n");
        }

        xml.push_str("  </files>\n");

        // Directory skeleton.
        xml.push_str("  <rootdir>\n");
        write_rootdir(&mut xml, &build_dir_tree(&self.dirs), 2);
        xml.push_str("  </rootdir>\n");
        xml.push_str("</psproject>\n");

        out.write_all(xml.as_bytes()).map_err(WriteError::IoFailed)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteError> {
        let file = File::create(path).map_err(WriteError::IoFailed)?;

        self.write(file)
    }
}

#[derive(Default)]
struct DirTree {
    children: BTreeMap<String, DirTree>,
}

fn build_dir_tree(dirs: &[String]) -> DirTree {
    let mut root = DirTree::default();

    for dir in dirs {
        let mut current = &mut root;

        for part in dir.split('/').filter(|p| !p.is_empty()) {
            current = current.children.entry(part.to_owned()).or_default();
        }
    }

    root
}

fn write_rootdir(xml: &mut String, tree: &DirTree, depth: usize) {
    for (name, child) in &tree.children {
        for _ in 0..depth {
            xml.push_str("  ");
        }

        xml.push_str("<dir");
        write_attr(xml, "targ_name", name);

        if child.children.is_empty() {
            xml.push_str("/>\n");
        } else {
            xml.push_str(">\n");
            write_rootdir(xml, child, depth + 1);

            for _ in 0..depth {
                xml.push_str("  ");
            }

            xml.push_str("</dir>\n");
        }
    }
}

fn write_attr(xml: &mut String, name: &str, value: &str) {
    write!(xml, " {}=\"{}\"", name, escape(value)).unwrap();
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }

    out
}

/// Errors for writing a project.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("cannot write project file")]
    IoFailed(#[source] std::io::Error),
}
