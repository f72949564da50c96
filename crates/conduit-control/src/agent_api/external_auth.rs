use conduit_core::{StoreError, now};
use conduit_proto::agent_v2::{GetExternalAuthRequest, GetExternalAuthResponse};
use regex::Regex;
use tonic::Status;

use super::{AgentApi, internal};
use crate::config::ExternalAuthProvider;

#[derive(Debug, Clone)]
pub struct ExternalAuthMatcher {
    pub id: String,
    pub provider_type: String,
    regex: Option<Regex>,
}

impl ExternalAuthMatcher {
    fn matches(&self, url: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(url))
    }
}

pub fn compile_external_auth(
    providers: &[ExternalAuthProvider],
) -> Result<Vec<ExternalAuthMatcher>, regex::Error> {
    providers
        .iter()
        .map(|p| {
            let regex = if p.regex.is_empty() {
                None
            } else {
                Some(Regex::new(&p.regex)?)
            };
            Ok(ExternalAuthMatcher {
                id: p.id.clone(),
                provider_type: p.provider_type.clone(),
                regex,
            })
        })
        .collect()
}

impl AgentApi {
    pub(super) async fn external_auth(
        &self,
        req: GetExternalAuthRequest,
    ) -> Result<GetExternalAuthResponse, Status> {
        let provider = if req.id.is_empty() {
            self.external_auth.iter().find(|p| p.matches(&req.match_url))
        } else {
            self.external_auth.iter().find(|p| p.id == req.id)
        };
        let Some(provider) = provider else {
            let wanted = if req.id.is_empty() {
                format!("url {:?}", req.match_url)
            } else {
                format!("id {:?}", req.id)
            };
            return Err(Status::not_found(format!(
                "no external auth provider matches {wanted}"
            )));
        };

        let mut resp = GetExternalAuthResponse {
            provider_id: provider.id.clone(),
            provider_type: provider.provider_type.clone(),
            ..Default::default()
        };
        match self.store.external_auth_link(&provider.id, self.owner.id).await {
            Ok(link) if link.expiry.is_none_or(|exp| exp > now()) => {
                resp.access_token = link.access_token;
            }
            Ok(_) | Err(StoreError::NotFound) => {
                resp.url = format!(
                    "{}/external-auth/{}",
                    self.opts.access_url.trim_end_matches('/'),
                    provider.id
                );
            }
            Err(e) => return Err(internal("get external auth link", e)),
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use conduit_core::models::ExternalAuthLink;
    use conduit_proto::agent_v2::GET_EXTERNAL_AUTH;

    use super::*;
    use crate::agent_api::testing::ApiHarness;

    fn providers() -> Vec<ExternalAuthProvider> {
        vec![
            ExternalAuthProvider {
                id: "github".to_string(),
                provider_type: "github".to_string(),
                regex: r"^https://github\.com/".to_string(),
            },
            ExternalAuthProvider {
                id: "gitlab".to_string(),
                provider_type: "gitlab".to_string(),
                regex: String::new(),
            },
        ]
    }

    async fn get(h: &ApiHarness, id: &str, url: &str) -> Result<GetExternalAuthResponse, Status> {
        h.client
            .unary(
                GET_EXTERNAL_AUTH,
                &GetExternalAuthRequest {
                    id: id.to_string(),
                    match_url: url.to_string(),
                },
            )
            .await
    }

    #[tokio::test]
    async fn linked_owner_gets_a_token() {
        let h = ApiHarness::with_external_auth(providers());
        h.fx.store.insert_external_auth_link(ExternalAuthLink {
            provider_id: "github".to_string(),
            user_id: h.fx.user.id,
            access_token: "gho_secret".to_string(),
            expiry: Some(now() + Duration::hours(1)),
        });

        let resp = get(&h, "", "https://github.com/acme/repo.git").await.unwrap();
        assert_eq!(resp.provider_id, "github");
        assert_eq!(resp.access_token, "gho_secret");
        assert!(resp.url.is_empty());
    }

    #[tokio::test]
    async fn unlinked_or_expired_owner_gets_a_login_url() {
        let h = ApiHarness::with_external_auth(providers());
        let resp = get(&h, "gitlab", "").await.unwrap();
        assert!(resp.access_token.is_empty());
        assert_eq!(resp.url, "https://dev.example.com/external-auth/gitlab");

        h.fx.store.insert_external_auth_link(ExternalAuthLink {
            provider_id: "github".to_string(),
            user_id: h.fx.user.id,
            access_token: "stale".to_string(),
            expiry: Some(now() - Duration::hours(1)),
        });
        let resp = get(&h, "github", "").await.unwrap();
        assert!(resp.access_token.is_empty());
        assert_eq!(resp.url, "https://dev.example.com/external-auth/github");
    }

    #[tokio::test]
    async fn unknown_providers_are_not_found() {
        let h = ApiHarness::with_external_auth(providers());
        let err = get(&h, "", "https://bitbucket.org/x").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
        let err = get(&h, "nope", "").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn bad_patterns_fail_to_compile() {
        let bad = vec![ExternalAuthProvider {
            id: "x".to_string(),
            provider_type: "x".to_string(),
            regex: "(".to_string(),
        }];
        assert!(compile_external_auth(&bad).is_err());
    }
}
