//! Process health for the monitoring surface

use keel_backend::HealthStatus;
use keel_engine::Runtime;

/// Aggregate health: every shard's verdict, plus the topology's age
pub fn check_health(rt: &Runtime) -> HealthStatus {
    let mut status = HealthStatus::ok();

    match rt.topology.get() {
        Ok(map) => {
            for shard in map.shards() {
                status.merge(shard.health());
            }
            if let Some(age_limit) = rt.env.options.monitor_config_age.get() {
                let age = map.created_at().elapsed();
                if age >= age_limit {
                    status.merge(HealthStatus::critical(format!(
                        "cannot update shard config for {} min",
                        age.as_secs() / 60
                    )));
                }
            }
        }
        Err(_) => {
            status.merge(HealthStatus::critical("no config available"));
            status.merge(rt.topology.config_shard().health());
        }
    }

    status
}
