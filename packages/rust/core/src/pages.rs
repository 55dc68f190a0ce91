//! Page-group discovery and page rendering.
//!
//! A run root may hold leaflet PDFs, directories of already rendered pages,
//! and loose images. Every PDF `<stem>.pdf` becomes the page-group `<stem>`,
//! rendered into `<root>/<stem>/`. Every other sub-directory is a page-group
//! of its own, and images directly in the root form the loose group.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bbqscan_shared::{BbqScanError, Result, natural_cmp};
use bbqscan_storage::LOOSE_GROUP;
use tokio::process::Command;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| wanted.iter().any(|w| e.eq_ignore_ascii_case(w)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Image files directly inside `dir`, in natural order. A missing directory is empty.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| BbqScanError::io(dir, e))? {
        let path = entry.map_err(|e| BbqScanError::io(dir, e))?.path();
        if path.is_file() && has_extension(&path, &IMAGE_EXTENSIONS) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    Ok(images)
}

/// A unit of processing and persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageGroup {
    /// Storage key and `folder` column value.
    pub key: String,
    /// Where the page images are (or will be rendered to).
    pub image_dir: PathBuf,
    /// Leaflet to render from, if any.
    pub source_pdf: Option<PathBuf>,
}

/// Find every page-group under `root`, in natural order with the loose group last.
///
/// Hidden directories are ignored. The loose group is only reported when the
/// root holds images or a loose result table already exists.
pub fn discover_groups(root: &Path, results_file: &str) -> Result<Vec<PageGroup>> {
    let entries = std::fs::read_dir(root).map_err(|e| BbqScanError::io(root, e))?;

    let mut groups: Vec<PageGroup> = Vec::new();
    let mut has_loose_images = false;
    for entry in entries {
        let path = entry.map_err(|e| BbqScanError::io(root, e))?.path();
        let name = file_name(&path);
        if name.starts_with('.') {
            continue;
        }

        if path.is_dir() {
            if name == LOOSE_GROUP || groups.iter().any(|g| g.key == name) {
                continue;
            }
            groups.push(PageGroup {
                image_dir: path,
                key: name,
                source_pdf: None,
            });
        } else if has_extension(&path, &["pdf"]) {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            match groups.iter_mut().find(|g| g.key == stem) {
                Some(existing) => existing.source_pdf = Some(path),
                None => groups.push(PageGroup {
                    image_dir: root.join(&stem),
                    key: stem,
                    source_pdf: Some(path),
                }),
            }
        } else if has_extension(&path, &IMAGE_EXTENSIONS) {
            has_loose_images = true;
        }
    }
    groups.sort_by(|a, b| natural_cmp(&a.key, &b.key));

    if has_loose_images || root.join(LOOSE_GROUP).join(results_file).is_file() {
        groups.push(PageGroup {
            key: LOOSE_GROUP.to_string(),
            image_dir: root.to_path_buf(),
            source_pdf: None,
        });
    }
    debug!(root = %root.display(), groups = groups.len(), "discovered page-groups");
    Ok(groups)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Turns a leaflet document into page images.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Render `pdf` into `out_dir`. Existing pages are kept unless `overwrite`.
    async fn render(&self, pdf: &Path, out_dir: &Path, overwrite: bool) -> Result<()>;
}

/// For runs where every page-group already has its images.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrerenderedPages;

#[async_trait]
impl PageRenderer for PrerenderedPages {
    async fn render(&self, pdf: &Path, _out_dir: &Path, _overwrite: bool) -> Result<()> {
        debug!(pdf = %pdf.display(), "rendering disabled, expecting existing images");
        Ok(())
    }
}

/// Renders PNG pages with poppler's `pdftoppm`.
///
/// Existing pages are only reused when every page `pdfinfo` reports is
/// present. Pages are rendered into a hidden staging directory and moved
/// into place once `pdftoppm` succeeds, so an interrupted render never
/// looks complete.
#[derive(Debug, Clone)]
pub struct PdftoppmRenderer {
    pub command: String,
    pub info_command: String,
    pub dpi: u32,
}

const STAGING_DIR: &str = ".rendering";

impl PdftoppmRenderer {
    /// `pdfinfo` is looked up next to `command` when that names a `pdftoppm` path.
    pub fn new(command: impl Into<String>, dpi: u32) -> Self {
        let command = command.into();
        let info_command = match Path::new(&command).file_name() {
            Some(name) if name == "pdftoppm" => Path::new(&command)
                .with_file_name("pdfinfo")
                .to_string_lossy()
                .into_owned(),
            _ => "pdfinfo".to_string(),
        };
        Self {
            command,
            info_command,
            dpi,
        }
    }

    pub fn with_info_command(mut self, info_command: impl Into<String>) -> Self {
        self.info_command = info_command.into();
        self
    }

    async fn run(&self, program: &str, args: &[&OsStr]) -> Result<std::process::Output> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                BbqScanError::Render(format!(
                    "failed to run `{program}`: {e}. Is poppler installed?"
                ))
            })?;
        if !output.status.success() {
            return Err(BbqScanError::Render(format!(
                "`{program}` failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    async fn page_count(&self, pdf: &Path) -> Result<usize> {
        let output = self.run(&self.info_command, &[pdf.as_os_str()]).await?;
        parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            BbqScanError::Render(format!(
                "`{}` reported no page count for {}",
                self.info_command,
                pdf.display()
            ))
        })
    }
}

/// The `Pages:` line of `pdfinfo` output.
fn parse_page_count(info: &str) -> Option<usize> {
    info.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|n| n.trim().parse().ok())
}

/// Page numbers of `<stem>-<n>.png` files in `dir`. `pdftoppm` zero-pads `n`.
fn rendered_pages(dir: &Path, stem: &str) -> Result<BTreeSet<usize>> {
    let prefix = format!("{stem}-");
    Ok(list_images(dir)?
        .iter()
        .filter_map(|p| {
            let name = file_name(p);
            let number = name.strip_prefix(&prefix)?.strip_suffix(".png")?;
            number.parse().ok()
        })
        .collect())
}

#[async_trait]
impl PageRenderer for PdftoppmRenderer {
    async fn render(&self, pdf: &Path, out_dir: &Path, overwrite: bool) -> Result<()> {
        let stem = pdf
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| BbqScanError::Render(format!("no file name: {}", pdf.display())))?;

        if !overwrite {
            let pages = self.page_count(pdf).await?;
            let present = rendered_pages(out_dir, &stem)?;
            if pages > 0 && (1..=pages).all(|n| present.contains(&n)) {
                debug!(pdf = %pdf.display(), pages, "pages already rendered");
                return Ok(());
            }
            if !present.is_empty() {
                warn!(
                    pdf = %pdf.display(),
                    expected = pages,
                    found = present.len(),
                    "incomplete page set, rendering again"
                );
            }
        }

        let staging = out_dir.join(STAGING_DIR);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| BbqScanError::io(&staging, e))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| BbqScanError::io(&staging, e))?;

        info!(pdf = %pdf.display(), dpi = self.dpi, "rendering leaflet pages");
        let dpi = self.dpi.to_string();
        let target = staging.join(&stem);
        self.run(
            &self.command,
            &[
                OsStr::new("-png"),
                OsStr::new("-r"),
                OsStr::new(&dpi),
                pdf.as_os_str(),
                target.as_os_str(),
            ],
        )
        .await?;

        for page in list_images(&staging)? {
            let dest = out_dir.join(file_name(&page));
            tokio::fs::rename(&page, &dest)
                .await
                .map_err(|e| BbqScanError::io(&dest, e))?;
        }
        tokio::fs::remove_dir_all(&staging)
            .await
            .map_err(|e| BbqScanError::io(&staging, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bbq-pages-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn images_are_naturally_ordered() {
        let root = temp_root();
        for name in ["page-10.png", "page-2.jpg", "page-1.PNG", "notes.txt"] {
            touch(&root.join(name));
        }
        let names: Vec<String> = list_images(&root).unwrap().iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["page-1.PNG", "page-2.jpg", "page-10.png"]);
        assert!(list_images(&root.join("missing")).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn discovers_pdfs_directories_and_loose_images() {
        let root = temp_root();
        touch(&root.join("migros-kw10.pdf"));
        touch(&root.join("coop-kw2").join("coop-kw2-1.png"));
        touch(&root.join("coop-kw10.pdf"));
        touch(&root.join("coop-kw10").join("coop-kw10-1.png"));
        touch(&root.join(".hidden").join("x.png"));
        touch(&root.join("flyer.jpg"));

        let groups = discover_groups(&root, "results.csv").unwrap();
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, ["coop-kw2", "coop-kw10", "migros-kw10", LOOSE_GROUP]);

        let coop10 = &groups[1];
        assert_eq!(coop10.source_pdf, Some(root.join("coop-kw10.pdf")));
        assert_eq!(coop10.image_dir, root.join("coop-kw10"));
        assert_eq!(groups[2].image_dir, root.join("migros-kw10"));
        assert_eq!(groups[3].image_dir, root);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn loose_group_survives_once_persisted() {
        let root = temp_root();
        touch(&root.join(LOOSE_GROUP).join("results.csv"));
        let groups = discover_groups(&root, "results.csv").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, LOOSE_GROUP);

        let empty = temp_root();
        assert!(discover_groups(&empty, "results.csv").unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&root);
        let _ = std::fs::remove_dir_all(&empty);
    }

    #[test]
    fn reads_page_count_and_rendered_pages() {
        let info = "Title:          KW 20\nPages:          12\nEncrypted:      no\n";
        assert_eq!(parse_page_count(info), Some(12));
        assert_eq!(parse_page_count("Title: x\n"), None);

        let root = temp_root();
        for name in ["lidl-01.png", "lidl-03.png", "lidl-x.png", "aldi-02.png"] {
            touch(&root.join(name));
        }
        assert_eq!(rendered_pages(&root, "lidl").unwrap(), BTreeSet::from([1, 3]));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn info_command_sits_next_to_pdftoppm() {
        let renderer = PdftoppmRenderer::new("/opt/poppler/bin/pdftoppm", 72);
        assert_eq!(renderer.info_command, "/opt/poppler/bin/pdfinfo");
        assert_eq!(PdftoppmRenderer::new("pdftoppm", 72).info_command, "pdfinfo");
    }

    #[cfg(unix)]
    fn script(path: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn renderer_skips_complete_page_sets() {
        let root = temp_root();
        let info = script(&root.join("fake-pdfinfo"), "echo 'Pages:          2'");
        touch(&root.join("lidl").join("lidl-1.png"));
        touch(&root.join("lidl").join("lidl-2.png"));

        // would fail if it were actually invoked
        let renderer =
            PdftoppmRenderer::new("definitely-not-a-real-binary", 72).with_info_command(info);
        renderer
            .render(&root.join("lidl.pdf"), &root.join("lidl"), false)
            .await
            .unwrap();

        let err = renderer
            .render(&root.join("lidl.pdf"), &root.join("lidl"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::Render(_)));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn renderer_redoes_an_interrupted_render() {
        let root = temp_root();
        let info = script(&root.join("fake-pdfinfo"), "echo 'Pages:          2'");
        // $5 is the output prefix after `-png -r <dpi> <pdf>`
        let render = script(
            &root.join("fake-pdftoppm"),
            "for i in 1 2; do printf page > \"$5-$i.png\"; done",
        );
        touch(&root.join("lidl.pdf"));
        touch(&root.join("lidl").join("lidl-1.png"));

        let renderer = PdftoppmRenderer::new(render, 72).with_info_command(info);
        renderer
            .render(&root.join("lidl.pdf"), &root.join("lidl"), false)
            .await
            .unwrap();

        let names: Vec<String> = list_images(&root.join("lidl"))
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, ["lidl-1.png", "lidl-2.png"]);
        assert_eq!(std::fs::read(root.join("lidl").join("lidl-1.png")).unwrap(), b"page");
        assert!(!root.join("lidl").join(STAGING_DIR).exists());
        let _ = std::fs::remove_dir_all(&root);
    }
}
