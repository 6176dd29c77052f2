use std::sync::Arc;

use crate::actions::ActionTable;
use crate::config::Config;
use crate::conflict::ConflictGuard;
use crate::dispatcher::Dispatcher;
use crate::reaper::Reaper;
use crate::registry::TaskRegistry;
use crate::resources::ResourceStore;
use crate::runner::OperationRunner;
use crate::scheduler::RecurringScheduler;
use crate::schedules::{ScheduleService, ScheduleStore};
use crate::status::StatusService;

/// Everything the routes and background loops share. One registry and one
/// conflict guard back both manual and scheduled dispatches.
#[derive(Clone)]
pub struct App {
  pub registry: TaskRegistry,
  pub dispatcher: Arc<Dispatcher>,
  pub status: StatusService,
  pub schedules: ScheduleService,
  pub scheduler: Arc<RecurringScheduler>,
  pub reaper: Arc<Reaper>,
}

impl App {
  pub fn new(
    config: &Config,
    actions: ActionTable,
    resources: Arc<dyn ResourceStore>,
    store: Arc<dyn ScheduleStore>,
  ) -> Self {
    let registry = TaskRegistry::new();
    let guard = Arc::new(ConflictGuard::new(config.conflict_classes.clone(), registry.clone()));
    let runner = OperationRunner::new(config.runner.clone());
    let dispatcher = Arc::new(Dispatcher::new(actions, guard, resources, runner));

    Self {
      status: StatusService::new(registry.clone()),
      schedules: ScheduleService::new(store.clone(), registry.clone()),
      scheduler: Arc::new(RecurringScheduler::new(store.clone(), dispatcher.clone())),
      reaper: Arc::new(Reaper::new(registry.clone(), store, config.reaper.clone())),
      dispatcher,
      registry,
    }
  }
}
