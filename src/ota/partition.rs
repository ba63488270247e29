use crate::platform::{PartitionInfo, PartitionTable};

/// Picks where updates go.
pub struct PartitionSelector<'a> {
    table: &'a dyn PartitionTable,
}

impl<'a> PartitionSelector<'a> {
    pub fn new(table: &'a dyn PartitionTable) -> Self {
        Self { table }
    }

    /// The inactive application slot. Never the factory partition.
    pub fn target_partition(&self) -> Option<PartitionInfo> {
        match self.table.next_update() {
            Some(p) if p.is_factory() => {
                log::error!("Refusing factory partition '{}' as update target", p.label());
                None
            }
            Some(p) => Some(p),
            None => {
                log::error!("No OTA partition available");
                None
            }
        }
    }

    pub fn factory_partition(&self) -> Option<PartitionInfo> {
        self.table.factory()
    }

    pub fn filesystem_partition(&self) -> Option<PartitionInfo> {
        self.table.filesystem()
    }

    pub fn running_partition(&self) -> Option<PartitionInfo> {
        self.table.running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPartitionTable;

    #[test]
    fn target_is_inactive_slot() {
        let table = SimPartitionTable::standard();
        let selector = PartitionSelector::new(&table);
        assert_eq!(selector.target_partition().unwrap().label(), "ota_1");
        assert_eq!(selector.factory_partition().unwrap().label(), "factory");
        assert_eq!(selector.filesystem_partition().unwrap().label(), "spiffs");
    }

    #[test]
    fn target_is_never_factory_even_when_running_from_it() {
        for running in ["factory", "ota_0", "ota_1"] {
            let table = SimPartitionTable::standard().running_from(running);
            let target = PartitionSelector::new(&table).target_partition().unwrap();
            assert!(!target.is_factory());
            assert_ne!(target.label(), running);
        }
    }

    #[test]
    fn missing_secondary_slot_yields_none() {
        let table = SimPartitionTable::standard().without_secondary_slot();
        assert!(PartitionSelector::new(&table).target_partition().is_none());
    }
}
