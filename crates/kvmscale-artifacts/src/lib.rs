//! Boot artifact generation.
//!
//! Before a domain can be defined, each new VM needs a qcow2 overlay
//! disk, a cloud-init seed ISO (meta-data + user-data), and a rendered
//! domain XML. [`CloudInitArtifacts`] produces all of them, driving
//! `qemu-img` and `cloud-localds` and rendering the templates embedded
//! in this crate. The controller only sees the [`ArtifactGenerator`]
//! trait, so tests can substitute a generator that writes a stub XML.
//!
//! On-disk layout:
//!
//! ```text
//! output/meta-data/meta-data-<id>
//! output/user-data/user-data-<id>
//! output/virt-config/instance-<id>
//! /var/lib/libvirt/images/overlay-<id>.qcow2
//! /var/lib/libvirt/images/cdrom-<id>.iso
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use askama::Template;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors raised while generating artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    #[error("template rendering failed: {0}")]
    Render(#[from] askama::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces the artifacts a single VM boots from and returns the path
/// of the rendered domain XML.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, id: &str, ssh_public_key: &str) -> Result<PathBuf, ArtifactError>;
}

#[derive(Template)]
#[template(path = "meta-data.txt", escape = "none")]
struct MetaDataTemplate<'a> {
    instance_id: &'a str,
    local_hostname: &'a str,
}

#[derive(Template)]
#[template(path = "user-data.txt", escape = "none")]
struct UserDataTemplate<'a> {
    hostname: &'a str,
    ssh_public_key: &'a str,
}

#[derive(Template)]
#[template(path = "domain.xml", escape = "none")]
struct DomainXmlTemplate<'a> {
    domain_name: &'a str,
    ga_socket_name: &'a str,
    overlay_image: &'a str,
    cdrom_image: &'a str,
    image_dir: &'a str,
    memory_mib: u32,
    vcpus: u32,
}

/// Cloud-init based artifact generator backed by `qemu-img` and
/// `cloud-localds`.
pub struct CloudInitArtifacts {
    output_dir: PathBuf,
    image_dir: PathBuf,
    base_image: String,
    overlay_size: String,
    memory_mib: u32,
    vcpus: u32,
}

impl Default for CloudInitArtifacts {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            image_dir: PathBuf::from("/var/lib/libvirt/images"),
            base_image: "jammy-server-cloudimg-amd64.img".to_string(),
            overlay_size: "5G".to_string(),
            memory_mib: 2048,
            vcpus: 2,
        }
    }
}

impl CloudInitArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn with_base_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = image.into();
        self
    }

    pub fn with_resources(mut self, memory_mib: u32, vcpus: u32) -> Self {
        self.memory_mib = memory_mib;
        self.vcpus = vcpus;
        self
    }

    fn overlay_path(&self, id: &str) -> PathBuf {
        self.image_dir.join(format!("overlay-{id}.qcow2"))
    }

    fn cdrom_path(&self, id: &str) -> PathBuf {
        self.image_dir.join(format!("cdrom-{id}.iso"))
    }

    async fn create_overlay_disk(&self, id: &str) -> Result<(), ArtifactError> {
        info!(%id, "generating qcow2 overlay disk");
        run_tool(
            "qemu-img",
            [
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-b"),
                OsStr::new(&self.base_image),
                OsStr::new("-F"),
                OsStr::new("qcow2"),
                self.overlay_path(id).as_os_str(),
                OsStr::new(&self.overlay_size),
            ],
        )
        .await
    }

    async fn write_meta_data(&self, id: &str) -> Result<PathBuf, ArtifactError> {
        let instance_id = format!("instance-{id}");
        let rendered = MetaDataTemplate {
            instance_id: &instance_id,
            local_hostname: &instance_id,
        }
        .render()?;

        let dir = self.output_dir.join("meta-data");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("meta-data-{id}"));
        tokio::fs::write(&path, rendered).await?;
        debug!(%id, path = %path.display(), "wrote meta-data");
        Ok(path)
    }

    async fn write_user_data(
        &self,
        id: &str,
        ssh_public_key: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let hostname = format!("instance-{id}");
        let rendered = UserDataTemplate {
            hostname: &hostname,
            ssh_public_key,
        }
        .render()?;

        let dir = self.output_dir.join("user-data");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("user-data-{id}"));
        tokio::fs::write(&path, rendered).await?;
        debug!(%id, path = %path.display(), "wrote user-data");
        Ok(path)
    }

    async fn build_cloudinit_iso(
        &self,
        id: &str,
        user_data: &Path,
        meta_data: &Path,
    ) -> Result<(), ArtifactError> {
        info!(%id, "generating cloud-init cdrom");
        run_tool(
            "cloud-localds",
            [
                self.cdrom_path(id).as_os_str(),
                user_data.as_os_str(),
                meta_data.as_os_str(),
            ],
        )
        .await
    }

    async fn write_domain_xml(&self, id: &str) -> Result<PathBuf, ArtifactError> {
        let domain_name = format!("instance-{id}");
        let ga_socket_name = format!("ga-socket-{id}");
        let overlay_image = format!("overlay-{id}");
        let cdrom_image = format!("cdrom-{id}");
        let image_dir = self.image_dir.display().to_string();
        let rendered = DomainXmlTemplate {
            domain_name: &domain_name,
            ga_socket_name: &ga_socket_name,
            overlay_image: &overlay_image,
            cdrom_image: &cdrom_image,
            image_dir: &image_dir,
            memory_mib: self.memory_mib,
            vcpus: self.vcpus,
        }
        .render()?;

        let dir = self.output_dir.join("virt-config");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("instance-{id}"));
        tokio::fs::write(&path, rendered).await?;
        debug!(%id, path = %path.display(), "wrote domain xml");
        Ok(path)
    }
}

#[async_trait]
impl ArtifactGenerator for CloudInitArtifacts {
    async fn generate(&self, id: &str, ssh_public_key: &str) -> Result<PathBuf, ArtifactError> {
        self.create_overlay_disk(id).await?;
        let meta_data = self.write_meta_data(id).await?;
        let user_data = self.write_user_data(id, ssh_public_key).await?;
        self.build_cloudinit_iso(id, &user_data, &meta_data).await?;
        self.write_domain_xml(id).await
    }
}

async fn run_tool<I, S>(tool: &str, args: I) -> Result<(), ArtifactError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool).args(args).output().await?;
    if !output.status.success() {
        return Err(ArtifactError::Tool {
            tool: tool.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
