//! Test helpers: a config whose every path lives inside a temp dir

#![allow(dead_code)]

use kiosk_shared::Config;
use kioskd::ports::fake::{FakeDisplay, FakeHttp, FakeOs, FakeSampler, FakeServices};
use kioskd::Ports;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

pub fn sandbox_config(dir: &TempDir) -> Config {
    let root = dir.path();
    let mut config = Config::default();
    config.paths.state_dir = root.join("state");
    config.recovery.renderer_cache_dirs = vec![root.join("renderer-cache")];
    config.resources.temp_dirs = vec![root.join("tmp")];
    config.resources.log_dirs = vec![root.join("log")];
    config.resources.artifact_dirs = vec![root.join("crash")];
    for dir in [root.join("renderer-cache"), root.join("tmp"), root.join("log"), root.join("crash")] {
        fs::create_dir_all(dir).unwrap();
    }
    config
}

pub struct FakeHost {
    pub services: Arc<FakeServices>,
    pub display: Arc<FakeDisplay>,
    pub http: Arc<FakeHttp>,
    pub os: Arc<FakeOs>,
    pub sampler: Arc<FakeSampler>,
}

impl FakeHost {
    /// Everything healthy and idle
    pub fn healthy(config: &Config) -> Self {
        Self::with_sampler(config, FakeSampler::new(&[40.0], &[30.0]))
    }

    pub fn with_sampler(config: &Config, sampler: FakeSampler) -> Self {
        Self {
            services: Arc::new(FakeServices::running(&[
                &config.services.application,
                &config.services.renderer,
                &config.services.display_server,
            ])),
            display: Arc::new(FakeDisplay::healthy()),
            http: Arc::new(FakeHttp::status(200)),
            os: Arc::new(FakeOs::new()),
            sampler: Arc::new(sampler),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            services: self.services.clone(),
            display: self.display.clone(),
            http: self.http.clone(),
            os: self.os.clone(),
            sampler: self.sampler.clone(),
            policy: Arc::new(|_: chrono::NaiveDateTime| "http://127.0.0.1:8080/health".to_string()),
        }
    }
}
