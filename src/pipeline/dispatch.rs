use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use crossbeam_channel::Sender;

use super::{Command, CommandDispatcher};
use crate::{config::ActionBinding, types::Label};

/// Forwards the command bound to a label; unbound labels do nothing.
pub struct ActionDispatcher {
    actions: BTreeMap<Label, Command>,
    command_tx: Sender<Command>,
}

impl ActionDispatcher {
    pub fn new(bindings: &[ActionBinding], command_tx: Sender<Command>) -> Self {
        Self {
            actions: bindings
                .iter()
                .map(|binding| (binding.label, binding.action))
                .collect(),
            command_tx,
        }
    }
}

impl CommandDispatcher for ActionDispatcher {
    fn dispatch(&mut self, label: Label, confidence: f32) -> Result<()> {
        let Some(command) = self.actions.get(&label).copied() else {
            return Ok(());
        };
        log::debug!("pose {label} ({:.0}%) -> {command:?}", confidence * 100.0);
        self.command_tx
            .send(command)
            .map_err(|_| anyhow!("command receiver disconnected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_labels_emit_their_command() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bindings = [ActionBinding {
            label: 1,
            action: Command::Scroll { dx: 0, dy: 200 },
        }];
        let mut dispatcher = ActionDispatcher::new(&bindings, tx);

        dispatcher.dispatch(1, 0.9).unwrap();
        dispatcher.dispatch(0, 0.9).unwrap();

        assert_eq!(rx.try_recv(), Ok(Command::Scroll { dx: 0, dy: 200 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_an_error() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let bindings = [ActionBinding {
            label: 2,
            action: Command::Scroll { dx: 0, dy: -200 },
        }];
        let mut dispatcher = ActionDispatcher::new(&bindings, tx);
        assert!(dispatcher.dispatch(2, 1.0).is_err());
    }
}
