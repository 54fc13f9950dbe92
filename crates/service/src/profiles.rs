//! Runtime switching between the canned tuning profiles. A switch
//! re-arms the scrape scheduler immediately; the content and AI
//! processors pick up their batch sizes on the next tick via the
//! shared config snapshot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use nieuws_core::config::{Config, Profile};
use nieuws_core::Error;
use nieuws_scrape::ScrapeScheduler;

#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub active: &'static str,
    pub available: Vec<&'static str>,
}

pub struct ProfileManager {
    config: Mutex<Config>,
    scheduler: Option<Arc<ScrapeScheduler>>,
}

impl ProfileManager {
    pub fn new(config: Config, scheduler: Option<Arc<ScrapeScheduler>>) -> Self {
        Self { config: Mutex::new(config), scheduler }
    }

    pub fn view(&self) -> ProfileView {
        ProfileView {
            active: self.config.lock().unwrap().profile.as_str(),
            available: Profile::all().iter().map(|p| p.as_str()).collect(),
        }
    }

    pub fn active_config(&self) -> Config {
        self.config.lock().unwrap().clone()
    }

    /// Switch to a named profile without restart.
    pub fn switch(&self, name: &str) -> Result<Profile, Error> {
        let profile = Profile::parse(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown profile '{name}'")))?;

        let mut config = self.config.lock().unwrap();
        config.apply_profile(profile);
        let interval = Duration::from_secs(config.scheduler.interval_minutes * 60);
        drop(config);

        if let Some(scheduler) = &self.scheduler {
            scheduler.update_interval(interval);
        }
        info!(profile = profile.as_str(), "Profile switched");
        Ok(profile)
    }

    /// Patch a single scheduler interval (minutes) on the active
    /// profile.
    pub fn patch_interval(&self, minutes: u64) -> Result<(), Error> {
        if minutes == 0 || minutes > 24 * 60 {
            return Err(Error::InvalidInput(format!(
                "interval_minutes out of range: {minutes}"
            )));
        }
        self.config.lock().unwrap().scheduler.interval_minutes = minutes;
        if let Some(scheduler) = &self.scheduler {
            scheduler.update_interval(Duration::from_secs(minutes * 60));
        }
        Ok(())
    }
}
