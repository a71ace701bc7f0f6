//! Remote person classifier client.
//!
//! Frames are uploaded as JPEG to an object detection service:
//!
//! `POST {api_url}?threshold={t}[&nmask={mask}]` with a `multipart/form-data` body holding a
//! single `file` part. `mask` is the URL-safe base64 of the JSON array
//! `[min_x, min_y, max_x, max_y]`. The service answers with a JSON list of
//! `[min_x, min_y, max_x, max_y, label, confidence]` tuples.
//!
//! Every failure is logged and mapped to "no person found".

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::detect::backend::PersonClassifier;
use crate::detect::result::{first_person, parse_detection_boxes, DetectionBox};
use crate::frame::{Frame, Rect, JPEG_QUALITY};

/// Moves an encoded frame to the classifier service and returns the raw response body.
pub trait ClassifierTransport: Send {
    fn post_image(&self, url: &str, filename: &str, jpeg: &[u8]) -> Result<String>;
}

/// Blocking HTTP transport (ureq).
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl ClassifierTransport for HttpTransport {
    fn post_image(&self, url: &str, filename: &str, jpeg: &[u8]) -> Result<String> {
        let boundary = format!("presence-kernel-{:016x}", rand::random::<u64>());
        let body = multipart_body(&boundary, filename, jpeg);
        let response = self
            .agent
            .post(url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body)
            .with_context(|| format!("post frame to classifier {}", url))?;
        response
            .into_string()
            .context("read classifier response body")
    }
}

fn multipart_body(boundary: &str, filename: &str, jpeg: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

/// URL-safe base64 of the mask rectangle as a JSON array.
pub fn encode_mask(rect: Rect) -> Result<String> {
    let json = serde_json::to_vec(&rect)?;
    Ok(URL_SAFE.encode(json))
}

/// Remote classifier client.
pub struct RemoteClassifier<T: ClassifierTransport = HttpTransport> {
    api_url: Url,
    transport: T,
}

impl RemoteClassifier<HttpTransport> {
    pub fn http(api_url: &str, timeout: Duration) -> Result<Self> {
        Self::new(api_url, HttpTransport::new(timeout))
    }
}

impl<T: ClassifierTransport> RemoteClassifier<T> {
    pub fn new(api_url: &str, transport: T) -> Result<Self> {
        let api_url =
            Url::parse(api_url).with_context(|| format!("invalid classifier url '{}'", api_url))?;
        match api_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported classifier scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self { api_url, transport })
    }

    /// Request URL for one call.
    pub fn request_url(&self, threshold: f32, exclusion: Option<Rect>) -> Result<String> {
        let mut url = self.api_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("threshold", &threshold.to_string());
            if let Some(rect) = exclusion {
                query.append_pair("nmask", &encode_mask(rect)?);
            }
        }
        Ok(url.into())
    }

    fn try_detect(
        &self,
        frame: &Frame,
        threshold: f32,
        exclusion: Option<Rect>,
    ) -> Result<Option<DetectionBox>> {
        let jpeg = frame.encode_jpeg(JPEG_QUALITY)?;
        let url = self.request_url(threshold, exclusion)?;
        let filename = format!(
            "presence_detector_{}",
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
        );
        let body = self.transport.post_image(&url, &filename, &jpeg)?;
        Ok(first_person(parse_detection_boxes(&body)?))
    }
}

impl<T: ClassifierTransport> PersonClassifier for RemoteClassifier<T> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn detect_person(
        &mut self,
        frame: &Frame,
        threshold: f32,
        exclusion: Option<Rect>,
    ) -> Option<DetectionBox> {
        match self.try_detect(frame, threshold, exclusion) {
            Ok(Some(person)) => {
                log::info!(
                    "classifier: person found at [{}, {}, {}, {}] conf={:.2}",
                    person.min_x,
                    person.min_y,
                    person.max_x,
                    person.max_y,
                    person.confidence
                );
                Some(person)
            }
            Ok(None) => None,
            Err(err) => {
                log::error!("could not contact presence classifier: {:#}", err);
                None
            }
        }
    }
}
