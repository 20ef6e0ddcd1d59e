//! Audio playback and music stream volume

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Error, Result, SnippetContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlayerId(pub u64);

pub trait MediaPlatform: Send + Sync {
    /// Prepares a player for the audio file at `path`
    fn create_player(&self, path: &str) -> Result<PlayerId>;
    fn start(&self, player: PlayerId);
    fn stop(&self, player: PlayerId);
    fn is_playing(&self, player: PlayerId) -> bool;
    fn release(&self, player: PlayerId);

    fn music_volume(&self) -> u32;
    fn music_max_volume(&self) -> u32;
    fn set_music_volume(&self, volume: u32);
}

pub struct MediaSnippet {
    platform: Arc<dyn MediaPlatform>,
    player: StdMutex<Option<PlayerId>>,
}

impl MediaSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { platform: ctx.services().media.clone(),
               player: StdMutex::new(None) }
    }

    /// Starts playing `path`, replacing whatever was playing before
    pub fn play_audio_file(&self, path: &str) -> Result<()> {
        let mut player = self.player.lock().unwrap();
        if let Some(previous) = player.take() {
            self.platform.release(previous);
        }
        let id = self.platform.create_player(path)?;
        self.platform.start(id);
        *player = Some(id);
        info!("Playing {}", path);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(id) = self.player.lock().unwrap().take() {
            self.platform.stop(id);
            self.platform.release(id);
            debug!("Playback stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        match *self.player.lock().unwrap() {
            Some(id) => self.platform.is_playing(id),
            None => false,
        }
    }

    pub fn set_music_volume(&self, volume: u32) -> Result<()> {
        let max = self.platform.music_max_volume();
        if volume > max {
            return Err(Error::InvalidArgument(format!("volume {} is above the maximum of {}",
                                                      volume, max)));
        }
        self.platform.set_music_volume(volume);
        Ok(())
    }
}

#[async_trait]
impl Snippet for MediaSnippet {
    fn name(&self) -> &'static str {
        "media"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "mediaPlayAudioFile" => to_value(self.play_audio_file(&args.get::<String>(0)?)?),
            "mediaStop" => to_value(self.stop()),
            "mediaIsPlaying" => to_value(self.is_playing()),
            "setMusicVolume" => to_value(self.set_music_volume(args.get(0)?)?),
            "getMusicVolume" => to_value(self.platform.music_volume()),
            "getMusicMaxVolume" => to_value(self.platform.music_max_volume()),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fake::FakePlatform;
    use crate::{ContextConfig, Platform};

    fn setup() -> (FakePlatform, MediaSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        (fake, MediaSnippet::new(&ctx))
    }

    #[test]
    fn playing_replaces_the_previous_player() {
        let (fake, snippet) = setup();
        fake.media.add_audio_file("/sdcard/a.mp3");
        fake.media.add_audio_file("/sdcard/b.mp3");
        assert!(!snippet.is_playing());

        snippet.play_audio_file("/sdcard/a.mp3").unwrap();
        snippet.play_audio_file("/sdcard/b.mp3").unwrap();
        assert!(snippet.is_playing());
        assert_eq!(fake.media.open_players(), 1);

        assert!(snippet.play_audio_file("/sdcard/missing.mp3").is_err());
        assert!(!snippet.is_playing());
        assert_eq!(fake.media.open_players(), 0);
    }

    #[test]
    fn shutdown_releases_the_player() {
        let (fake, snippet) = setup();
        fake.media.add_audio_file("/sdcard/a.mp3");
        snippet.play_audio_file("/sdcard/a.mp3").unwrap();
        snippet.shutdown();
        assert_eq!(fake.media.open_players(), 0);
        // Stopping twice is fine
        snippet.stop();
    }

    #[tokio::test]
    async fn volume_is_range_checked() {
        let (_fake, snippet) = setup();
        let none = RpcArgs::default();
        let max = snippet.call("getMusicMaxVolume", &none).await.unwrap();
        let max = max.as_u64().unwrap();
        snippet.call("setMusicVolume", &RpcArgs::new(vec![json!(max)])).await.unwrap();
        assert_eq!(snippet.call("getMusicVolume", &none).await.unwrap(), json!(max));

        let err = snippet.call("setMusicVolume", &RpcArgs::new(vec![json!(max + 1)]))
                         .await
                         .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(matches!(snippet.call("setMusicVolume", &RpcArgs::new(vec![json!(-1)])).await,
                         Err(Error::InvalidArgument(_))));
    }
}
