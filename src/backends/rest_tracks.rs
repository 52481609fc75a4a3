//! REST/JSON track API adapter implementation.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backends::TracksBackend;
use crate::config::ApiConfig;
use crate::error::CatalogError;
use crate::media_uri::api_root;
use crate::protocol::{Track, TrackDraft, TrackId, TrackPatch, TracksPage, UploadFile};
use crate::query_state::QueryState;

/// Track API adapter backed by `ureq`.
pub struct RestTracksBackend {
    http_client: ureq::Agent,
    api_root: String,
}

#[derive(serde::Serialize)]
struct BulkDeleteBody<'a> {
    ids: &'a [TrackId],
}

impl RestTracksBackend {
    pub fn new(config: &ApiConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout_read(config.request_timeout())
            .timeout_write(config.request_timeout())
            .build();
        Self {
            http_client,
            api_root: api_root(&config.base_url),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    fn make_boundary() -> String {
        let mut bytes = [0u8; 12];
        let _ = getrandom::fill(&mut bytes);
        let suffix: String = bytes.iter().map(|value| format!("{value:02x}")).collect();
        format!("----trackdeck{suffix}")
    }

    /// Pulls a human-readable message out of an error body, which the API
    /// sends as `{"error": ...}` or `{"message": ...}` but proxies may not.
    fn error_message(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|parsed| {
                parsed
                    .get("error")
                    .or_else(|| parsed.get("message"))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .unwrap_or_else(|| body.trim().to_string())
    }

    fn map_error(action: &str, err: ureq::Error) -> CatalogError {
        match err {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                let message = Self::error_message(&body);
                if status == 404 {
                    CatalogError::NotFound(if message.is_empty() {
                        format!("{action}: not found")
                    } else {
                        message
                    })
                } else {
                    CatalogError::Server { status, message }
                }
            }
            ureq::Error::Transport(transport) => {
                CatalogError::Network(format!("{action} failed: {transport}"))
            }
        }
    }

    fn read_json<T: DeserializeOwned>(
        action: &str,
        response: ureq::Response,
    ) -> Result<T, CatalogError> {
        response
            .into_json::<T>()
            .map_err(|err| CatalogError::Decode(format!("{action} response parse failed: {err}")))
    }

    fn multipart_body(boundary: &str, file: &UploadFile) -> Vec<u8> {
        let mut body = Vec::with_capacity(file.bytes.len() + 256);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                file.file_name.replace('"', "")
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.content_type).as_bytes());
        body.extend_from_slice(&file.bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }
}

impl TracksBackend for RestTracksBackend {
    fn list_tracks(&self, query: &QueryState) -> Result<TracksPage, CatalogError> {
        let mut request = self.http_client.get(&self.url("/tracks"));
        for (key, value) in query.to_api_params() {
            request = request.query(&key, &value);
        }
        let response = request
            .call()
            .map_err(|err| Self::map_error("list tracks", err))?;
        Self::read_json("list tracks", response)
    }

    fn get_track(&self, id: &str) -> Result<Option<Track>, CatalogError> {
        let response = self
            .http_client
            .get(&self.url("/tracks"))
            .query("id", id)
            .call();
        let page: TracksPage = match response {
            Ok(response) => Self::read_json("get track", response)?,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(Self::map_error("get track", err)),
        };
        Ok(page.data.into_iter().find(|track| track.id == id))
    }

    fn genres(&self) -> Result<Vec<String>, CatalogError> {
        let response = self
            .http_client
            .get(&self.url("/genres"))
            .call()
            .map_err(|err| Self::map_error("genres", err))?;
        Self::read_json("genres", response)
    }

    fn create_track(&self, draft: &TrackDraft) -> Result<Track, CatalogError> {
        let response = self
            .http_client
            .post(&self.url("/tracks"))
            .send_json(draft)
            .map_err(|err| Self::map_error("create track", err))?;
        Self::read_json("create track", response)
    }

    fn update_track(&self, id: &str, patch: &TrackPatch) -> Result<Track, CatalogError> {
        let path = format!("/tracks/{}", urlencoding::encode(id));
        let response = self
            .http_client
            .put(&self.url(&path))
            .send_json(patch)
            .map_err(|err| Self::map_error("update track", err))?;
        Self::read_json("update track", response)
    }

    fn delete_track(&self, id: &str) -> Result<(), CatalogError> {
        let path = format!("/tracks/{}", urlencoding::encode(id));
        let _ = self
            .http_client
            .delete(&self.url(&path))
            .call()
            .map_err(|err| Self::map_error("delete track", err))?;
        Ok(())
    }

    fn bulk_delete(&self, ids: &[TrackId]) -> Result<(), CatalogError> {
        let _ = self
            .http_client
            .post(&self.url("/tracks/delete"))
            .send_json(BulkDeleteBody { ids })
            .map_err(|err| Self::map_error("bulk delete", err))?;
        Ok(())
    }

    fn upload_file(&self, id: &str, file: &UploadFile) -> Result<Track, CatalogError> {
        let path = format!("/tracks/{}/upload", urlencoding::encode(id));
        let boundary = Self::make_boundary();
        let body = Self::multipart_body(&boundary, file);
        let response = self
            .http_client
            .post(&self.url(&path))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body)
            .map_err(|err| Self::map_error("upload file", err))?;
        Self::read_json("upload file", response)
    }

    fn remove_file(&self, id: &str) -> Result<(), CatalogError> {
        let path = format!("/tracks/{}/file", urlencoding::encode(id));
        let _ = self
            .http_client
            .delete(&self.url(&path))
            .call()
            .map_err(|err| Self::map_error("remove file", err))?;
        Ok(())
    }
}
