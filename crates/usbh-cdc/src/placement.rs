//! Scheduling placement of the dispatch thread

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use core_affinity::CoreId;
use thread_priority::{ThreadPriority, ThreadPriorityValue};

/// Priority and core the dispatch thread applies to itself before serving
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Placement {
    priority: Option<ThreadPriorityValue>,
    core: Option<CoreId>,
}

impl Placement {
    /// Check the requested priority and core against this machine
    pub fn resolve(config: &DriverConfig) -> Result<Self> {
        let priority = match config.task_priority {
            0 => None,
            value => Some(ThreadPriorityValue::try_from(value).map_err(|e| {
                Error::InvalidArgument(format!("task priority {}: {}", value, e))
            })?),
        };

        let core = match config.task_core_id {
            None => None,
            Some(id) => {
                let cores = core_affinity::get_core_ids().unwrap_or_default();
                let core = cores.into_iter().find(|core| core.id == id).ok_or_else(|| {
                    Error::InvalidArgument(format!("core {} is not available for pinning", id))
                })?;
                Some(core)
            }
        };

        Ok(Self { priority, core })
    }

    /// Apply to the calling thread
    pub fn apply(&self) -> std::result::Result<(), String> {
        if let Some(core) = self.core
            && !core_affinity::set_for_current(core)
        {
            return Err(format!("failed to pin to core {}", core.id));
        }
        if let Some(priority) = self.priority {
            thread_priority::set_current_thread_priority(ThreadPriority::Crossplatform(priority))
                .map_err(|e| format!("failed to set priority {:?}: {:?}", priority, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_inherits() {
        let placement = Placement::resolve(&DriverConfig::default()).unwrap();
        assert!(placement.priority.is_none());
        assert!(placement.core.is_none());
        assert!(placement.apply().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_priority() {
        let config = DriverConfig {
            task_priority: 200,
            ..Default::default()
        };
        let err = Placement::resolve(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rejects_unknown_core() {
        let config = DriverConfig {
            task_core_id: Some(usize::MAX),
            ..Default::default()
        };
        let err = Placement::resolve(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_pins_to_available_core() {
        let Some(first) = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().next())
        else {
            return;
        };
        let config = DriverConfig {
            task_core_id: Some(first.id),
            ..Default::default()
        };
        let placement = Placement::resolve(&config).unwrap();
        assert_eq!(placement.core.map(|core| core.id), Some(first.id));

        // Pin a scratch thread so the test harness thread keeps its mask
        let applied = std::thread::spawn(move || placement.apply()).join().unwrap();
        assert!(applied.is_ok());
    }
}
