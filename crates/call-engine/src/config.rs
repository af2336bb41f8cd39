//! Call configuration: the externally supplied network-relay (ICE) setup and
//! local media constraints. This engine never runs its own STUN/TURN.

/// One STUN/TURN entry, as handed in by the deployment.
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// No ICE servers at all; loopback-only candidates. Used by tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            media: MediaConstraints::default(),
        }
    }

    pub fn builder() -> CallConfigBuilder {
        CallConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct CallConfigBuilder {
    ice_servers: Vec<IceServerConfig>,
    media: Option<MediaConstraints>,
}

impl CallConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn media(mut self, media: MediaConstraints) -> Self {
        self.media = Some(media);
        self
    }

    pub fn audio_only(mut self) -> Self {
        self.media = Some(MediaConstraints {
            audio: true,
            video: false,
        });
        self
    }

    pub fn build(self) -> CallConfig {
        let mut config = CallConfig::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(media) = self.media {
            config.media = media;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_a_stun_server() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.media.audio && config.media.video);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = CallConfig::builder()
            .add_ice_server_with_credentials(
                vec!["turn:turn.example.net:3478".into()],
                "user".into(),
                "secret".into(),
            )
            .audio_only()
            .build();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "user");
        assert!(!config.media.video);
    }

    #[test]
    fn localhost_preset_has_no_ice_servers() {
        assert!(CallConfig::localhost().ice_servers.is_empty());
    }
}
