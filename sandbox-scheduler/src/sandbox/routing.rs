use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Machine, Task};

/// Route that disables all network traffic of the machine
pub const ROUTE_NONE: &str = "none";

/// Network route applied to one machine for the length of an analysis
#[async_trait]
pub trait Route: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the route; false when it could not be applied
    async fn route_network(&self) -> bool;

    async fn unroute_network(&self);
}

/// Picks the route for a task
pub trait Routing: Send + Sync {
    fn route_for(&self, task: &Task, machine: &Machine) -> Arc<dyn Route>;
}

/// Route that only records its application; forwarding rules are left to
/// the host's network setup
#[derive(Debug, Clone)]
pub struct StaticRoute {
    name: String,
    vmname: String,
    interface: Option<String>,
}

#[async_trait]
impl Route for StaticRoute {
    fn name(&self) -> &str {
        &self.name
    }

    async fn route_network(&self) -> bool {
        if self.name != ROUTE_NONE && self.interface.is_none() {
            warn!(
                vmname = %self.vmname,
                route = %self.name,
                "Machine has no network interface, cannot apply route"
            );
            return false;
        }
        info!(vmname = %self.vmname, route = %self.name, action = "route.enable", "Network route enabled");
        true
    }

    async fn unroute_network(&self) {
        info!(vmname = %self.vmname, route = %self.name, action = "route.disable", "Network route disabled");
    }
}

/// Chooses between a fixed set of configured routes
#[derive(Debug, Clone)]
pub struct StaticRouting {
    default_route: String,
    routes: Vec<String>,
}

impl StaticRouting {
    pub fn new(default_route: impl Into<String>, routes: Vec<String>) -> Self {
        Self {
            default_route: default_route.into(),
            routes,
        }
    }

    /// Route requested by the task, the default, or `none` for unknown names
    pub fn resolve(&self, task: &Task) -> String {
        let requested = task
            .route
            .as_deref()
            .or_else(|| task.option("route"))
            .unwrap_or(&self.default_route);

        if requested == ROUTE_NONE || self.routes.iter().any(|r| r == requested) {
            requested.to_string()
        } else {
            warn!(task_id = task.id, route = requested, "Unknown route requested, using 'none'");
            ROUTE_NONE.to_string()
        }
    }
}

impl Routing for StaticRouting {
    fn route_for(&self, task: &Task, machine: &Machine) -> Arc<dyn Route> {
        Arc::new(StaticRoute {
            name: self.resolve(task),
            vmname: machine.name.clone(),
            interface: machine.interface.clone(),
        })
    }
}
