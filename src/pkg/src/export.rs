use crate::entry::Entry;
use crate::header::ContentType;
use crate::{volume_type, Pkg, PfsAccessError};
use gp4::Project;
use log::warn;
use pfs::image::Image;
use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use util::new_buffer;

/// Metas regenerated at packaging time; never part of a project.
const GENERATED: &[u32] = &[
    Entry::DIGESTS,
    Entry::ENTRY_KEYS,
    Entry::IMAGE_KEY,
    Entry::GENERAL_DIGESTS,
    Entry::METAS,
    Entry::ENTRY_NAMES,
    Entry::LICENSE_DAT,
    Entry::LICENSE_INFO,
    Entry::PSRESERVED_DAT,
    Entry::APP_PLAYGO_CHUNK_DAT,
    Entry::APP_PLAYGO_CHUNK_SHA,
    Entry::APP_PLAYGO_MANIFEST_XML,
];

const COPY_BUFFER: usize = 32768;

/// Final status of an export.
pub struct ExportReport {
    /// Entries and files that could not be written; the rest of the export
    /// still completed.
    pub failures: Vec<ExportFailure>,
}

pub struct ExportFailure {
    pub name: String,
    pub reason: String,
}

impl Pkg {
    /// Rebuilds a GP4 project tree from the package.
    ///
    /// `progress` receives `(percent, message)`; the percentage only
    /// reaches 100 after `Project.gp4` is on disk. `cancel` is checked
    /// between entries and between tree nodes.
    pub fn export_project(
        &self,
        dir: &Path,
        decrypt_entries: bool,
        progress: &mut dyn FnMut(u32, &str),
        cancel: &AtomicBool,
    ) -> Result<ExportReport, ExportError> {
        let volume = volume_type(self.header.content_type())
            .ok_or_else(|| ExportError::UnsupportedContentType(self.header.content_type()))?;
        let passcode = self
            .keys
            .passcode
            .clone()
            .unwrap_or_else(|| crypto::ZERO_PASSCODE.to_owned());

        create_dir_all(dir)
            .map_err(|e| ExportError::CreateDirectoryFailed(dir.to_path_buf(), e))?;

        let mut project = Project::new(volume, self.header.content_id(), &passcode);
        let mut failures = Vec::new();

        // Open the inner file system up front so the progress total covers
        // both phases.
        let inner = match self.pfs_image() {
            Some(_) => Some(self.inner_pfs()?),
            None => None,
        };
        let tree = match &inner {
            Some(pfs) => Some(pfs.build_tree().map_err(ExportError::WalkInnerFailed)?),
            None => None,
        };

        let exported: Vec<(usize, String)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !GENERATED.contains(&e.id()))
            .filter_map(|(i, _)| self.entry_name(i).map(|n| (i, n.to_owned())))
            .collect();

        let mut total: u64 = exported
            .iter()
            .map(|(i, _)| self.entries[*i].data_size() as u64)
            .sum();

        if let Some(tree) = &tree {
            total += tree
                .walk_breadth_first(tree.uroot())
                .iter()
                .map(|&i| tree.node(i).size())
                .sum::<u64>();
        }

        let total = total.max(1);
        let mut done: u64 = 0;
        let mut dirs: HashSet<String> = HashSet::new();

        // Meta entries, in table order.
        for (index, name) in &exported {
            if cancel.load(Ordering::Relaxed) {
                return Err(ExportError::Cancelled);
            }

            let rel = format!("sce_sys/{name}");

            progress(percent(done, total), &rel);

            if let Err(e) = self.export_entry(dir, &rel, *index, decrypt_entries, &mut project, &mut dirs)
            {
                warn!("skipping {rel}: {e}");
                failures.push(ExportFailure {
                    name: rel,
                    reason: e.to_string(),
                });
                continue;
            }

            done += self.entries[*index].data_size() as u64;
            progress(percent(done, total), name);
        }

        // The project gets a clean param.sfo: creation date moves into the
        // project metadata and the packaging tool info goes away.
        if let Err(e) = rewrite_param(dir, &mut project) {
            failures.push(ExportFailure {
                name: "sce_sys/param.sfo".into(),
                reason: e.to_string(),
            });
        }

        // Additional content records its entitlement key.
        if matches!(
            self.header.content_type(),
            ContentType::Ac | ContentType::Al
        ) {
            match self.entitlement_key() {
                Ok(key) => {
                    let mut hex = String::with_capacity(32);

                    for b in key {
                        use std::fmt::Write as _;

                        write!(hex, "{b:02x}").unwrap();
                    }

                    project.set_entitlement_key(&hex);
                }
                Err(e) => failures.push(ExportFailure {
                    name: "license.dat".into(),
                    reason: e.to_string(),
                }),
            }
        }

        // The game tree.
        if let (Some(pfs), Some(tree)) = (&inner, &tree) {
            project.set_volume_timestamp(&format_utc(pfs.header().time1_sec()));

            for index in tree.walk_breadth_first(tree.uroot()) {
                if cancel.load(Ordering::Relaxed) {
                    return Err(ExportError::Cancelled);
                }

                let node = tree.node(index);
                let rel = tree.path(index)[1..].to_owned();
                let out = dir.join(&rel);

                if node.is_directory() {
                    create_dir_all(&out)
                        .map_err(|e| ExportError::CreateDirectoryFailed(out.clone(), e))?;
                    project.add_dir(&rel);
                    continue;
                }

                progress(percent(done, total), &rel);

                match self.export_pfs_file(pfs, node.inode(), &out) {
                    Ok(copied) => {
                        project.add_file(&rel, &rel);
                        done += copied;
                    }
                    Err(e) => {
                        warn!("skipping {rel}: {e}");
                        failures.push(ExportFailure {
                            name: rel.clone(),
                            reason: e.to_string(),
                        });
                    }
                }

                progress(percent(done, total), &rel);
            }
        }

        project
            .save(dir.join("Project.gp4"))
            .map_err(ExportError::WriteProjectFailed)?;
        progress(100, "Project.gp4");

        Ok(ExportReport { failures })
    }

    fn export_entry(
        &self,
        dir: &Path,
        rel: &str,
        index: usize,
        decrypt: bool,
        project: &mut Project,
        dirs: &mut HashSet<String>,
    ) -> Result<(), EntryExportError> {
        let data = self
            .extract_entry(index, decrypt)
            .map_err(EntryExportError::ExtractFailed)?;
        let path = dir.join(rel);

        // Register sce_sys/<subdir> chains the first time they appear.
        let mut parent = String::new();

        for part in rel.split('/').rev().skip(1).collect::<Vec<_>>().iter().rev() {
            if !parent.is_empty() {
                parent.push('/');
            }

            parent.push_str(part);

            if dirs.insert(parent.clone()) {
                project.add_dir(&parent);
            }
        }

        if let Some(p) = path.parent() {
            create_dir_all(p).map_err(EntryExportError::IoFailed)?;
        }

        File::create(&path)
            .and_then(|mut f| f.write_all(&data))
            .map_err(EntryExportError::IoFailed)?;

        project.add_file(rel, rel);

        Ok(())
    }

    fn export_pfs_file(
        &self,
        pfs: &pfs::Pfs,
        inode: usize,
        out: &Path,
    ) -> Result<u64, FileExportError> {
        let view = pfs.file_view(inode).map_err(FileExportError::ViewFailed)?;
        let mut file = File::create(out).map_err(FileExportError::IoFailed)?;
        let mut buffer = new_buffer(COPY_BUFFER);
        let mut offset = 0u64;
        let size = view.size();

        while offset < size {
            let amount = COPY_BUFFER.min((size - offset) as usize);

            view.read(offset, &mut buffer[..amount])
                .map_err(FileExportError::ReadFailed)?;
            file.write_all(&buffer[..amount])
                .map_err(FileExportError::IoFailed)?;
            offset += amount as u64;
        }

        Ok(size)
    }
}

/// Moves `c_date`/`c_time` from PUBTOOLINFO into the project creation date
/// and strips the packaging tool fields.
fn rewrite_param(dir: &Path, project: &mut Project) -> Result<(), ParamRewriteError> {
    let path = dir.join("sce_sys/param.sfo");
    let raw = std::fs::read(&path).map_err(ParamRewriteError::IoFailed)?;
    let mut param = sfo::Sfo::read(&raw).map_err(ParamRewriteError::ParseFailed)?;

    if let Some(info) = param.get("PUBTOOLINFO").and_then(|v| v.as_str()) {
        let mut date = None;
        let mut time = None;

        for (key, value) in sfo::split_pairs(info) {
            match key {
                "c_date" => date = Some(value.to_owned()),
                "c_time" => time = Some(value.to_owned()),
                _ => {}
            }
        }

        if let Some(date) = date.filter(|d| d.len() == 8) {
            let time = time.filter(|t| t.len() == 6);
            let (h, m, s) = match &time {
                Some(t) => (&t[0..2], &t[2..4], &t[4..6]),
                None => ("00", "00", "00"),
            };

            project.set_creation_date(&format!(
                "{}-{}-{} {}:{}:{}",
                &date[0..4],
                &date[4..6],
                &date[6..8],
                h,
                m,
                s
            ));
        }
    }

    param.remove("PUBTOOLINFO");
    param.remove("PUBTOOLVER");

    std::fs::write(&path, param.to_bytes()).map_err(ParamRewriteError::IoFailed)
}

fn percent(done: u64, total: u64) -> u32 {
    ((done * 100 / total) as u32).min(99)
}

fn format_utc(secs: u64) -> String {
    match chrono::DateTime::from_timestamp(secs as i64, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Errors that abort the whole export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("content type {0:?} cannot be exported")]
    UnsupportedContentType(ContentType),

    #[error("cannot create a directory {0}")]
    CreateDirectoryFailed(std::path::PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Pfs(#[from] PfsAccessError),

    #[error("cannot walk inner PFS")]
    WalkInnerFailed(#[source] pfs::WalkError),

    #[error("export was cancelled")]
    Cancelled,

    #[error("cannot write Project.gp4")]
    WriteProjectFailed(#[source] gp4::WriteError),
}

/// Per-entry failures; collected, not fatal.
#[derive(Debug, Error)]
enum EntryExportError {
    #[error(transparent)]
    ExtractFailed(crate::ExtractEntryError),

    #[error("cannot write the file")]
    IoFailed(#[source] std::io::Error),
}

#[derive(Debug, Error)]
enum FileExportError {
    #[error(transparent)]
    ViewFailed(pfs::FileViewError),

    #[error("cannot read the file from the image")]
    ReadFailed(#[source] pfs::image::ReadError),

    #[error("cannot write the file")]
    IoFailed(#[source] std::io::Error),
}

#[derive(Debug, Error)]
enum ParamRewriteError {
    #[error("cannot access the extracted param.sfo")]
    IoFailed(#[source] std::io::Error),

    #[error("cannot parse the extracted param.sfo")]
    ParseFailed(#[source] sfo::ReadError),
}
