//! Firmware packages and where they come from.

use crate::error::{DfuError, Result};

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ComponentKind {
    Application,
    Bootloader,
    Softdevice,
}

impl ComponentKind {
    /// File name, without extension, of the component's files in a package directory
    pub fn base_filename(self) -> &'static str {
        match self {
            ComponentKind::Application => "application",
            ComponentKind::Bootloader => "bootloader",
            ComponentKind::Softdevice => "softdevice",
        }
    }
}

/// One firmware image of a package
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PackageComponent {
    pub kind: ComponentKind,
    /// Firmware image (`.hex` or `.bin`)
    pub data: PathBuf,
    /// Init packet (`.dat`)
    pub metadata: Option<PathBuf>,
    pub version: String,
}

impl PackageComponent {
    /// Locate a component's files in an extracted package directory.
    ///
    /// `<base>.hex` is preferred; otherwise the files named by a Nordic
    /// `manifest.json` are used. The metadata file may be absent.
    pub fn from_directory(dir: &Path, version: &str, kind: ComponentKind) -> Result<Self> {
        let base = dir.join(kind.base_filename());
        let data = base.with_extension("hex");
        if data.is_file() {
            let metadata = base.with_extension("dat");
            return Ok(PackageComponent {
                kind,
                data,
                metadata: metadata.is_file().then_some(metadata),
                version: version.to_owned(),
            });
        }

        let manifest = dir.join("manifest.json");
        if manifest.is_file() {
            let manifest: serde_json::Value = serde_json::from_reader(std::fs::File::open(&manifest)?)?;
            let comp = &manifest["manifest"][kind.base_filename()];
            if let Some(bin) = comp["bin_file"].as_str() {
                let data = dir.join(bin);
                if data.is_file() {
                    let metadata = comp["dat_file"].as_str().map(|dat| dir.join(dat)).filter(|p| p.is_file());
                    return Ok(PackageComponent { kind, data, metadata, version: version.to_owned() });
                }
            }
        }

        Err(DfuError::MissingDataFile(data))
    }
}

/// The firmware installed by one DFU session
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Package {
    pub application: PackageComponent,
    /// Written, and the ring rebooted, before the application
    pub bootloader: Option<PackageComponent>,
}

impl Package {
    pub fn write_count(&self) -> usize {
        if self.bootloader.is_some() { 2 } else { 1 }
    }
}

pub trait PackageSource {
    async fn resolve_package(&self) -> Result<Package>;
}

/// A downloadable firmware archive
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Firmware {
    pub kind: ComponentKind,
    pub version: String,
    /// Where the archive can be fetched from
    pub location: String,
}

/// Firmware available for a ring, as returned by the firmware service
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FirmwareResult {
    pub applications: Vec<Firmware>,
    pub bootloaders: Vec<Firmware>,
}

/// Retrieves firmware archives
pub trait FirmwareFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Fetches archives from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl FirmwareFetcher for FileFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(location).await?)
    }
}

/// Downloads the first application and (optional) first bootloader of a
/// firmware result and unpacks each into its own temporary directory.
///
/// The directories live as long as the source.
pub struct ArchivePackageSource<F> {
    result: FirmwareResult,
    fetcher: F,
    workspaces: Mutex<Vec<TempDir>>,
}

impl<F: FirmwareFetcher> ArchivePackageSource<F> {
    pub fn new(result: FirmwareResult, fetcher: F) -> Self {
        ArchivePackageSource { result, fetcher, workspaces: Mutex::new(Vec::new()) }
    }

    async fn component(&self, firmware: &Firmware) -> Result<PackageComponent> {
        log::info!("Fetching {:?} {} from {}", firmware.kind, firmware.version, firmware.location);
        let bytes = self.fetcher.fetch(&firmware.location).await?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", firmware.version, firmware.kind.base_filename()))
            .tempdir()?;
        unzip(&bytes, workspace.path())?;
        let component = PackageComponent::from_directory(workspace.path(), &firmware.version, firmware.kind)?;
        self.workspaces.lock().unwrap_or_else(|e| e.into_inner()).push(workspace);
        Ok(component)
    }
}

impl<F: FirmwareFetcher> PackageSource for ArchivePackageSource<F> {
    async fn resolve_package(&self) -> Result<Package> {
        let application = self.result.applications.first().ok_or(DfuError::NoApplicationComponent)?;
        let application = self.component(application).await?;
        let bootloader = match self.result.bootloaders.first() {
            Some(bootloader) => Some(self.component(bootloader).await?),
            None => None,
        };
        Ok(Package { application, bootloader })
    }
}

/// A package that has already been extracted
#[derive(Debug, Clone)]
pub struct DirectoryPackageSource {
    pub application: (PathBuf, String),
    pub bootloader: Option<(PathBuf, String)>,
}

impl PackageSource for DirectoryPackageSource {
    async fn resolve_package(&self) -> Result<Package> {
        let (dir, version) = &self.application;
        let application = PackageComponent::from_directory(dir, version, ComponentKind::Application)?;
        let bootloader = match &self.bootloader {
            Some((dir, version)) => Some(PackageComponent::from_directory(dir, version, ComponentKind::Bootloader)?),
            None => None,
        };
        Ok(Package { application, bootloader })
    }
}

fn unzip(bytes: &[u8], dir: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
    zip.extract(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{TestContext, zip_archive};

    #[test]
    fn component_tolerates_missing_metadata() {
        let ctx = TestContext::new();
        ctx.create_file("pkg/application.hex", ":00000001FF\n");

        let component = PackageComponent::from_directory(&ctx.path("pkg"), "1.4.0", ComponentKind::Application).unwrap();
        assert_eq!(component.data, ctx.path("pkg/application.hex"));
        assert_eq!(component.metadata, None);
        assert_eq!(component.version, "1.4.0");
    }

    #[test]
    fn component_requires_data_file() {
        let ctx = TestContext::new();
        ctx.create_file("pkg/bootloader.dat", "init");

        let err = PackageComponent::from_directory(&ctx.path("pkg"), "1.1", ComponentKind::Bootloader).unwrap_err();
        assert!(matches!(err, DfuError::MissingDataFile(path) if path.ends_with("bootloader.hex")));
    }

    #[test]
    fn component_from_nordic_manifest() {
        let ctx = TestContext::new();
        ctx.create_file(
            "pkg/manifest.json",
            r#"{"manifest":{"application":{"bin_file":"app.bin","dat_file":"app.dat"}}}"#,
        );
        ctx.create_file_bytes("pkg/app.bin", &[1, 2, 3]);
        ctx.create_file_bytes("pkg/app.dat", &[4]);

        let component = PackageComponent::from_directory(&ctx.path("pkg"), "2.0", ComponentKind::Application).unwrap();
        assert_eq!(component.data, ctx.path("pkg/app.bin"));
        assert_eq!(component.metadata, Some(ctx.path("pkg/app.dat")));
    }

    #[tokio::test]
    async fn archive_source_unpacks_application_and_bootloader() {
        let ctx = TestContext::new();
        let app = ctx.create_file_bytes(
            "app.zip",
            &zip_archive(&[("application.hex", b":00000001FF\n".as_slice()), ("application.dat", b"dat")]),
        );
        let bl = ctx.create_file_bytes("bl.zip", &zip_archive(&[("bootloader.hex", b":00000001FF\n".as_slice())]));
        let result = FirmwareResult {
            applications: vec![Firmware {
                kind: ComponentKind::Application,
                version: "2.1.0".into(),
                location: app.display().to_string(),
            }],
            bootloaders: vec![Firmware {
                kind: ComponentKind::Bootloader,
                version: "1.1".into(),
                location: bl.display().to_string(),
            }],
        };

        let source = ArchivePackageSource::new(result, FileFetcher);
        let package = source.resolve_package().await.unwrap();
        assert_eq!(package.write_count(), 2);
        assert!(package.application.data.is_file());
        assert!(package.application.metadata.is_some());
        let bootloader = package.bootloader.unwrap();
        assert_eq!(bootloader.version, "1.1");
        assert_eq!(bootloader.metadata, None);
    }

    #[tokio::test]
    async fn archive_source_requires_application() {
        let source = ArchivePackageSource::new(FirmwareResult::default(), FileFetcher);
        assert!(matches!(source.resolve_package().await, Err(DfuError::NoApplicationComponent)));
    }
}
