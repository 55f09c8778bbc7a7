use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use base64::Engine;
use image::imageops::FilterType;
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{
    BackgroundLoaded, InvalidImage, LoadBackground, PreparedDepthCpu, PreparedImageCpu,
};
use crate::processing::layout::capped_size;

/// Largest texture side we upload; bigger images are downscaled on decode.
pub const DEFAULT_MAX_TEXTURE_DIM: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Inline(Vec<u8>),
    Remote(String),
    File(PathBuf),
}

impl ImageSource {
    /// Accepts `data:` URLs, `http(s)://` URLs, `file://` URLs and bare paths.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix("data:") {
            let (header, payload) = rest
                .split_once(',')
                .context("data URL without payload separator")?;
            let bytes = if header.ends_with(";base64") {
                base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .context("data URL is not valid base64")?
            } else {
                payload.as_bytes().to_vec()
            };
            return Ok(Self::Inline(bytes));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Self::Remote(url.to_string()));
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = url.split_once("://") {
            bail!("unsupported image scheme {scheme:?}");
        }
        if url.is_empty() {
            bail!("empty image url");
        }
        Ok(Self::File(PathBuf::from(url)))
    }
}

#[derive(Clone)]
pub struct BackgroundLoader {
    client: reqwest::Client,
    max_dim: u32,
}

impl BackgroundLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            max_dim: DEFAULT_MAX_TEXTURE_DIM,
        }
    }

    pub fn with_max_dim(mut self, max_dim: u32) -> Self {
        self.max_dim = max_dim.max(1);
        self
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match ImageSource::parse(url)? {
            ImageSource::Inline(bytes) => Ok(bytes),
            ImageSource::Remote(url) => {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("fetching {url}"))?
                    .error_for_status()
                    .with_context(|| format!("fetching {url}"))?;
                Ok(response.bytes().await?.to_vec())
            }
            ImageSource::File(path) => tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn color(&self, url: &str) -> Result<PreparedImageCpu> {
        let bytes = self.fetch(url).await?;
        let max_dim = self.max_dim;
        let rgba = tokio::task::spawn_blocking(move || decode_rgba8(&bytes, max_dim)).await??;
        let (width, height) = rgba.dimensions();
        Ok(PreparedImageCpu {
            source: url.to_string(),
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    async fn depth(&self, url: &str) -> Result<PreparedDepthCpu> {
        let bytes = self.fetch(url).await?;
        let max_dim = self.max_dim;
        let luma = tokio::task::spawn_blocking(move || decode_luma8(&bytes, max_dim)).await??;
        let (width, height) = luma.dimensions();
        Ok(PreparedDepthCpu {
            width,
            height,
            samples: luma.into_raw(),
        })
    }

    /// Fetch and decode both layers. A broken colour image is an error; a
    /// broken depth map only degrades to a flat layer.
    pub async fn load(&self, request: &LoadBackground) -> Result<BackgroundLoaded> {
        let depth = async {
            match &request.depth_url {
                Some(url) => Some(self.depth(url).await),
                None => None,
            }
        };
        let (color, depth) = futures::join!(self.color(&request.color_url), depth);
        let color = color.with_context(|| format!("loading {}", request.color_url))?;
        let depth = match depth {
            Some(Ok(depth)) => Some(depth),
            Some(Err(err)) => {
                warn!(url = ?request.depth_url, error = %err, "depth map unusable; rendering flat");
                None
            }
            None => None,
        };
        Ok(BackgroundLoaded { color, depth })
    }
}

fn decode_rgba8(bytes: &[u8], max_dim: u32) -> Result<image::RgbaImage> {
    let img = capped(image::load_from_memory(bytes)?, max_dim);
    Ok(img.to_rgba8())
}

fn decode_luma8(bytes: &[u8], max_dim: u32) -> Result<image::GrayImage> {
    let img = capped(image::load_from_memory(bytes)?, max_dim);
    Ok(img.to_luma8())
}

fn capped(img: image::DynamicImage, max_dim: u32) -> image::DynamicImage {
    let (w, h) = (img.width(), img.height());
    let (cw, ch) = capped_size(w, h, max_dim);
    if (cw, ch) == (w, h) {
        img
    } else {
        debug!(from = ?(w, h), to = ?(cw, ch), "downscaling oversized image");
        img.resize_exact(cw, ch, FilterType::Triangle)
    }
}

/// Loads backgrounds as requests arrive. Only the most recent request is
/// delivered; a new request aborts any load still in progress.
pub async fn run(
    loader: BackgroundLoader,
    mut load_rx: Receiver<LoadBackground>,
    invalid_tx: Sender<InvalidImage>,
    to_viewer: Sender<BackgroundLoaded>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tasks: JoinSet<(u64, String, Result<BackgroundLoaded>)> = JoinSet::new();
    let mut latest = 0u64;

    loop {
        select! {
            _ = cancel.cancelled() => break,

            Some(request) = load_rx.recv() => {
                // superseded loads are abandoned
                tasks.abort_all();
                latest += 1;
                let seq = latest;
                let loader = loader.clone();
                debug!(url = %request.color_url, seq, "loading background");
                tasks.spawn(async move {
                    let result = loader.load(&request).await;
                    (seq, request.color_url, result)
                });
            }

            Some(joined) = tasks.join_next() => {
                let Ok((seq, url, result)) = joined else {
                    continue;
                };
                if seq != latest {
                    debug!(%url, seq, latest, "dropping superseded background");
                    continue;
                }
                match result {
                    Ok(loaded) => {
                        if to_viewer.send(loaded).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%url, error = %format!("{err:#}"), "background image invalid");
                        let _ = invalid_tx.send(InvalidImage(url)).await;
                    }
                }
            }

            else => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn png(width: u32, height: u32, luma: u8) -> Vec<u8> {
        let img = image::GrayImage::from_pixel(width, height, image::Luma([luma]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn data_url(bytes: &[u8]) -> String {
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    fn loader() -> BackgroundLoader {
        BackgroundLoader::new(reqwest::Client::new())
    }

    #[test]
    fn parses_supported_sources() {
        assert_eq!(
            ImageSource::parse("https://cdn.example/a.png").unwrap(),
            ImageSource::Remote("https://cdn.example/a.png".into())
        );
        assert_eq!(
            ImageSource::parse("file:///tmp/a.png").unwrap(),
            ImageSource::File(PathBuf::from("/tmp/a.png"))
        );
        assert_eq!(
            ImageSource::parse("assets/a.png").unwrap(),
            ImageSource::File(PathBuf::from("assets/a.png"))
        );
        assert_eq!(
            ImageSource::parse("data:text/plain;base64,aGk=").unwrap(),
            ImageSource::Inline(b"hi".to_vec())
        );
        assert!(ImageSource::parse("scripted://image/1").is_err());
        assert!(ImageSource::parse("data:image/png;base64").is_err());
        assert!(ImageSource::parse("").is_err());
    }

    #[tokio::test]
    async fn loads_colour_and_depth() {
        let request = LoadBackground {
            color_url: data_url(&png(4, 2, 200)),
            depth_url: Some(data_url(&png(4, 2, 255))),
        };
        let loaded = loader().load(&request).await.unwrap();
        assert_eq!((loaded.color.width, loaded.color.height), (4, 2));
        assert_eq!(loaded.color.pixels.len(), 4 * 2 * 4);
        let depth = loaded.depth.unwrap();
        assert_eq!(depth.samples, vec![255; 8]);
    }

    #[tokio::test]
    async fn broken_depth_renders_flat() {
        let request = LoadBackground {
            color_url: data_url(&png(2, 2, 10)),
            depth_url: Some("data:image/png;base64,bm90IGFuIGltYWdl".into()),
        };
        let loaded = loader().load(&request).await.unwrap();
        assert!(loaded.depth.is_none());
    }

    #[tokio::test]
    async fn broken_colour_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");
        let request = LoadBackground {
            color_url: path.display().to_string(),
            depth_url: None,
        };
        assert!(loader().load(&request).await.is_err());
    }

    #[tokio::test]
    async fn reads_files_and_downscales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        std::fs::write(&path, png(40, 10, 0)).unwrap();
        let request = LoadBackground {
            color_url: format!("file://{}", path.display()),
            depth_url: None,
        };
        let loaded = loader().with_max_dim(20).load(&request).await.unwrap();
        assert_eq!((loaded.color.width, loaded.color.height), (20, 5));
    }

    #[tokio::test]
    async fn newer_request_aborts_pending_fetch() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (load_tx, load_rx) = mpsc::channel(4);
        let (invalid_tx, _invalid_rx) = mpsc::channel(4);
        let (viewer_tx, mut viewer_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let task = tokio::spawn(run(
            BackgroundLoader::new(client),
            load_rx,
            invalid_tx,
            viewer_tx,
            cancel.clone(),
        ));

        load_tx
            .send(LoadBackground {
                color_url: format!("http://{addr}/stalled.png"),
                depth_url: None,
            })
            .await
            .unwrap();
        // accept and never answer
        let (mut socket, _) = listener.accept().await.unwrap();

        let good = data_url(&png(2, 2, 9));
        load_tx
            .send(LoadBackground {
                color_url: good.clone(),
                depth_url: None,
            })
            .await
            .unwrap();
        let loaded = tokio::time::timeout(Duration::from_secs(5), viewer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.color.source, good);

        // the stalled request's connection is dropped once its task is aborted
        let mut sink = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_reports_invalid_images() {
        let (load_tx, load_rx) = mpsc::channel(4);
        let (invalid_tx, mut invalid_rx) = mpsc::channel(4);
        let (viewer_tx, mut viewer_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(loader(), load_rx, invalid_tx, viewer_tx, cancel.clone()));

        load_tx
            .send(LoadBackground {
                color_url: "data:image/png;base64,AAAA".into(),
                depth_url: None,
            })
            .await
            .unwrap();
        let invalid = tokio::time::timeout(Duration::from_secs(5), invalid_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(invalid.0.starts_with("data:"));

        let good = data_url(&png(3, 3, 1));
        load_tx
            .send(LoadBackground {
                color_url: good.clone(),
                depth_url: None,
            })
            .await
            .unwrap();
        let loaded = tokio::time::timeout(Duration::from_secs(5), viewer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.color.source, good);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
