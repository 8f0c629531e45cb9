//! HTTP [`BoardBackend`] for a board controller running outside the server
//! process.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::board::{BoardBackend, MoveLeadCommand, MoveLeadResponse};
use super::models::BoardProjection;
use crate::errors::BoardError;

#[derive(Serialize)]
struct MoveBody<'a> {
    stage_id: &'a str,
    tenant_id: &'a str,
}

pub struct HttpBoardBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBoardBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn move_url(&self, lead_id: &str) -> String {
        format!("{}/api/leads/{}/move", self.base_url, lead_id)
    }

    fn board_url(&self, tenant_id: &str) -> String {
        format!("{}/api/tenants/{}/board", self.base_url, tenant_id)
    }

    async fn post_move(&self, command: &MoveLeadCommand) -> anyhow::Result<MoveLeadResponse> {
        // Error statuses still carry a `{success, error}` body.
        let response = self
            .client
            .post(self.move_url(&command.lead_id))
            .json(&MoveBody {
                stage_id: &command.stage_id,
                tenant_id: &command.tenant_id,
            })
            .send()
            .await
            .context("Failed to send stage move")?;
        let status = response.status();
        let text = response.text().await.context("Failed to read move response")?;
        match serde_json::from_str::<MoveLeadResponse>(&text) {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Ok(MoveLeadResponse::failed(format!(
                "Server returned {}",
                status
            ))),
            Err(e) => Err(e).context("Failed to parse move response"),
        }
    }

    async fn fetch_board(&self, tenant_id: &str) -> anyhow::Result<BoardProjection> {
        self.client
            .get(self.board_url(tenant_id))
            .send()
            .await
            .context("Failed to fetch board")?
            .error_for_status()
            .context("Board request returned error status")?
            .json::<BoardProjection>()
            .await
            .context("Failed to parse board")
    }
}

#[async_trait]
impl BoardBackend for HttpBoardBackend {
    async fn move_lead(&self, command: &MoveLeadCommand) -> MoveLeadResponse {
        match self.post_move(command).await {
            Ok(response) => response,
            Err(e) => MoveLeadResponse::failed(format!("{:#}", e)),
        }
    }

    async fn load_board(&self, tenant_id: &str) -> Result<BoardProjection, BoardError> {
        self.fetch_board(tenant_id)
            .await
            .map_err(BoardError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_strip_trailing_slash() {
        let backend = HttpBoardBackend::new("http://localhost:3100/");
        assert_eq!(
            backend.move_url("lead-1"),
            "http://localhost:3100/api/leads/lead-1/move"
        );
        assert_eq!(
            backend.board_url("t1"),
            "http://localhost:3100/api/tenants/t1/board"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_failed_move() {
        let backend = HttpBoardBackend::new("http://127.0.0.1:9");
        let response = backend
            .move_lead(&MoveLeadCommand {
                lead_id: "l1".into(),
                stage_id: "s1".into(),
                tenant_id: "t1".into(),
            })
            .await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_board_load() {
        let backend = HttpBoardBackend::new("http://127.0.0.1:9");
        let err = backend.load_board("t1").await.unwrap_err();
        assert!(matches!(err, BoardError::Transport(_)));
    }
}
