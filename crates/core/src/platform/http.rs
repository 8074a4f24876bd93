//! Companion-service clients over HTTP/JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{merge_bounds, ClientDirectory, FocusService, VisionService};
use crate::error::{Error, Result};
use crate::settings::Endpoints;
use crate::types::ClientId;

#[derive(Debug, Deserialize)]
struct BoundsResult {
    #[serde(default)]
    boxes: Vec<[i32; 4]>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PidBody {
    pid: ClientId,
}

#[derive(Debug, Deserialize)]
struct TargetBody {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct InitData {
    #[serde(rename = "PidsData", default)]
    pids_data: BTreeMap<ClientId, String>,
}

pub struct HttpServices {
    agent: ureq::Agent,
    endpoints: Endpoints,
    merge_px: i32,
}

impl HttpServices {
    pub fn new(endpoints: Endpoints, timeout: Duration, merge_px: i32) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoints,
            merge_px,
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        Ok(self.agent.get(url).call()?.into_json()?)
    }
}

fn vision(e: Error) -> Error {
    Error::Vision(e.to_string())
}

impl FocusService for HttpServices {
    fn foreground(&self) -> Result<ClientId> {
        let body: PidBody = self.get_json(&self.endpoints.foreground)?;
        Ok(body.pid)
    }

    fn request_foreground(&self, id: ClientId) -> Result<()> {
        self.agent
            .post(&self.endpoints.foreground)
            .send_json(PidBody { pid: id })?;
        Ok(())
    }
}

impl VisionService for HttpServices {
    fn bounds(&self) -> Result<Vec<[i32; 4]>> {
        let result: BoundsResult = self.get_json(&self.endpoints.bounds).map_err(vision)?;
        Ok(merge_bounds(result.boxes, self.merge_px))
    }

    fn current_target(&self) -> Result<Option<String>> {
        let body: TargetBody = self.get_json(&self.endpoints.target).map_err(vision)?;
        Ok(Some(body.name).filter(|n| !n.is_empty()))
    }
}

impl ClientDirectory for HttpServices {
    fn clients(&self) -> Result<BTreeMap<ClientId, String>> {
        let data: InitData = self.get_json(&self.endpoints.clients)?;
        Ok(data.pids_data)
    }
}
