//! Configuration reload decisions

use crate::config::WorkerConfig;

/// Whether switching to `new` needs all workers rebuilt
///
/// Broker addresses and subscribed queues are fixed for a worker's
/// lifetime; everything else can be swapped in place.
pub fn requires_restart(old: &WorkerConfig, new: &WorkerConfig) -> bool {
    old.server != new.server
        || old.dupserver != new.dupserver
        || old.dup_server_backlog_queue_size != new.dup_server_backlog_queue_size
        || old.hosts != new.hosts
        || old.services != new.services
        || old.eventhandler != new.eventhandler
        || old.notifications != new.notifications
        || old.hostgroups != new.hostgroups
        || old.servicegroups != new.servicegroups
}

/// Whether the interpreter daemon has to be restarted
pub fn epn_changed(old: &WorkerConfig, new: &WorkerConfig) -> bool {
    old.enable_embedded_perl != new.enable_embedded_perl
        || old.use_perl_cache != new.use_perl_cache
        || old.p1_file != new.p1_file
        || old.debug != new.debug
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base() -> WorkerConfig {
        WorkerConfig::new(vec!["gm1:4730".into()])
            .with_checks(true, true)
            .with_key("secret")
    }

    #[test]
    fn test_disruptive_fields() {
        let old = base();
        assert!(!requires_restart(&old, &base()));

        let mut new = base();
        new.server.push("gm2:4730".into());
        assert!(requires_restart(&old, &new));

        let mut new = base();
        new.hostgroups = vec!["linux".into()];
        assert!(requires_restart(&old, &new));

        let mut new = base();
        new.notifications = true;
        assert!(requires_restart(&old, &new));

        let mut new = base();
        new.dup_server_backlog_queue_size = 10;
        assert!(requires_restart(&old, &new));
    }

    #[test]
    fn test_soft_fields() {
        let old = base();
        let new = base()
            .with_identifier("other")
            .with_workers(5, 50)
            .with_idle_timeout(Duration::from_secs(60))
            .with_key("rotated");
        assert!(!requires_restart(&old, &new));
        assert!(!epn_changed(&old, &new));

        let mut new = base();
        new.debug = 2;
        assert!(!requires_restart(&old, &new));
        assert!(epn_changed(&old, &new));

        let mut new = base();
        new.enable_embedded_perl = true;
        assert!(epn_changed(&old, &new));
    }
}
