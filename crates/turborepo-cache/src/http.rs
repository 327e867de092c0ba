use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_api_client::{
    retry::{retry_future, DEFAULT_MAX_RETRIES},
    APIAuth, APIClient, Response,
};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

/// The remote cache layer.
///
/// Bodies are built fully in memory before upload; task outputs are small
/// relative to the network round trip. When signing is configured, uploads
/// carry an HMAC tag and downloads are verified before any byte reaches the
/// working tree.
pub struct HTTPCache {
    client: APIClient,
    auth: APIAuth,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    max_retries: u32,
}

impl HTTPCache {
    pub fn new(client: APIClient, opts: &CacheOpts, auth: APIAuth) -> HTTPCache {
        let signer_verifier = opts
            .remote_cache_opts
            .as_ref()
            .filter(|remote_cache_opts| remote_cache_opts.signature)
            .map(|_| {
                ArtifactSignatureAuthenticator::new(
                    auth.team_id
                        .as_deref()
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec(),
                    None,
                )
            });

        HTTPCache {
            client,
            auth,
            signer_verifier,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut artifact_body = Vec::new();
        self.write(&mut artifact_body, anchor, files)?;

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash.as_bytes(), &artifact_body))
            .transpose()?;

        debug!("uploading {hash} ({} bytes)", artifact_body.len());
        retry_future(self.max_retries, || {
            self.client.put_artifact(
                hash,
                artifact_body.clone(),
                duration,
                tag.as_deref(),
                &self.auth,
            )
        })
        .await?;
        debug!("uploaded {hash}");
        Ok(())
    }

    fn write(
        &self,
        writer: impl std::io::Write,
        anchor: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
    ) -> Result<(), CacheError> {
        let mut archive = CacheWriter::from_writer(writer, true)?;
        for file in files {
            archive.add_file(anchor, file)?;
        }
        archive.finish()
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let response = retry_future(self.max_retries, || {
            self.client.artifact_exists(hash, &self.auth)
        })
        .await?;

        let Some(response) = response else {
            return Ok(None);
        };

        let duration = Self::duration_from_response(&response)?;
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    /// Downloads and verifies an artifact, returning its raw bytes. The
    /// caller decides whether to seed the local layer before restoring.
    #[tracing::instrument(skip_all)]
    pub async fn fetch_bytes(&self, hash: &str) -> Result<Option<(u64, Vec<u8>)>, CacheError> {
        let response = retry_future(self.max_retries, || {
            self.client.fetch_artifact(hash, &self.auth)
        })
        .await?;

        let Some(response) = response else {
            debug!("remote cache miss for {hash}");
            return Ok(None);
        };

        let duration = Self::duration_from_response(&response)?;
        let expected_tag = response
            .headers()
            .get("x-artifact-tag")
            .map(|tag| {
                tag.to_str()
                    .map(|tag| tag.to_string())
                    .map_err(|_| CacheError::InvalidTag)
            })
            .transpose()?;

        let body = response
            .bytes()
            .await
            .map_err(turborepo_api_client::Error::from)?;

        if let Some(signer_verifier) = &self.signer_verifier {
            let expected_tag = expected_tag.ok_or(CacheError::ArtifactTagMissing)?;
            if !signer_verifier.validate(hash.as_bytes(), &body, &expected_tag)? {
                return Err(CacheError::InvalidTag);
            }
        }

        Ok(Some((duration, body.to_vec())))
    }

    /// Restores raw archive bytes directly to the working tree, for
    /// configurations with no local layer.
    pub fn restore_tar(
        root: &AbsoluteSystemPath,
        body: &[u8],
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut reader = CacheReader::from_reader(body, true)?;
        reader.restore(root)
    }

    fn duration_from_response(response: &Response) -> Result<u64, CacheError> {
        response
            .headers()
            .get("x-artifact-duration")
            .map(|duration| {
                duration
                    .to_str()
                    .map_err(|_| CacheError::InvalidDuration)?
                    .parse::<u64>()
                    .map_err(|_| CacheError::InvalidDuration)
            })
            .unwrap_or(Ok(0))
    }
}
