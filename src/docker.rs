use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter},
    path::Path,
};

use bollard::Docker;
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::spec::{ImageRef, ImageSource, ResourceName, StackSpec};

/// Concrete image reference for every container of a stack, keyed by container name.
pub type ResolvedImages = BTreeMap<ResourceName, String>;

#[derive(Clone, PartialEq, Eq)]
pub struct ImageHash {
    hash: [u8; 32],
}

impl Debug for ImageHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImageHash({})", self.shorthex())
    }
}

impl ImageHash {
    pub fn image_name(&self) -> String {
        // fyi docker specifically rejects 64 character hex strings
        format!("webstack_{}", self.shorthex())
    }

    /// convert to hex the first 64 bits of this hash
    pub fn shorthex(&self) -> String {
        self.hash
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl ImageSource {
    /// a hash that uniquely identifies the build of this source
    pub fn content_hash(&self, build_context_tarred: &[u8]) -> ImageHash {
        let mut hasher = Sha256::new();
        hasher.update(build_context_tarred);
        ImageHash {
            hash: hasher.finalize().into(),
        }
    }

    /// Tar the build context and hash it without building anything.
    pub fn image_tag(&self) -> anyhow::Result<ImageHash> {
        let tar = tarchive(&self.directory, &self.directory.join(&self.file))?;
        Ok(self.content_hash(&tar))
    }
}

pub async fn build_image(source: &ImageSource) -> anyhow::Result<ImageHash> {
    let docker = Docker::connect_with_local_defaults()?;
    let tar = tarchive(&source.directory, &source.directory.join(&source.file))?;
    let hash = source.content_hash(&tar);
    let tag = hash.image_name();
    info!(context = %source.directory.display(), %tag, "building image");

    let options = bollard::image::BuildImageOptions {
        dockerfile: "Dockerfile",
        t: tag.as_str(),
        rm: true,
        ..Default::default()
    };
    let mut stream = docker.build_image(options, None, Some(tar.into()));
    while let Some(item) = stream.try_next().await? {
        if let Some(error) = item.error {
            anyhow::bail!("building {tag} failed: {error}");
        }
        if let Some(line) = item.stream {
            debug!(target: "webstack::docker::build", "{}", line.trim_end());
        }
    }
    Ok(hash)
}

/// Work out the image each container runs. Assets are hashed, and built too when `build`
/// is set. Published images pass through untouched.
pub async fn resolve_images(stack: &StackSpec, build: bool) -> anyhow::Result<ResolvedImages> {
    let mut images = ResolvedImages::new();
    for container in &stack.task.containers {
        let reference = match &container.image {
            ImageRef::Registry(reference) => reference.clone(),
            ImageRef::Asset(source) if build => build_image(source).await?.image_name(),
            ImageRef::Asset(source) => source.image_tag()?.image_name(),
        };
        images.insert(container.name.clone(), reference);
    }
    Ok(images)
}

/// currently does not heed .dockerignore
fn tarchive(build_context: &Path, build_file: &Path) -> anyhow::Result<Vec<u8>> {
    if build_context.join("Dockerfile").exists() {
        anyhow::ensure!(
            build_context.join("Dockerfile") == build_file,
            "Build context may only contain 'Dockerfile' if the stack points to it. \
             This is a limitation in the builder."
        );
    }

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", build_context)?;
    if build_file != build_context.join("Dockerfile") {
        archive.append_path_with_name(build_file, "Dockerfile")?;
    }
    let archive = archive.into_inner()?;
    Ok(archive)
}
