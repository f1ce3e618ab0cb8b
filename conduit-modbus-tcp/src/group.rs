//! Modbus request groups built from block properties.

use conduit_core::{BlockDescriptor, Direction, TriggerMode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("block {block}: invalid properties: {reason}")]
    Properties { block: String, reason: String },
    #[error("block {block}: unit id {unit_id} out of range 0..=247")]
    UnitId { block: String, unit_id: u16 },
    #[error("block {block}: unsupported function code {func_code}")]
    FunctionCode { block: String, func_code: u8 },
    #[error("block {block}: count {count} out of range 1..={max} for function {func_code}")]
    Count {
        block: String,
        func_code: u8,
        count: u16,
        max: u16,
    },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GroupProperties {
    unit_id: u16,
    func_code: u8,
    address: u16,
    count: u16,
}

impl Default for GroupProperties {
    fn default() -> Self {
        Self {
            unit_id: 1,
            func_code: 3,
            address: 0,
            count: 1,
        }
    }
}

/// One block translated to a Modbus request
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusGroup {
    pub block_id: String,
    pub unit_id: u8,
    pub func_code: u8,
    pub address: u16,
    pub count: u16,
    pub period: Duration,
    /// Cyclic read, polled on every elapsed period
    pub polled: bool,
    pub tags: usize,
}

/// Largest quantity a single request may carry
fn max_count(func_code: u8) -> Option<u16> {
    match func_code {
        1 | 2 => Some(2000),
        3 | 4 => Some(125),
        5 | 6 => Some(1),
        15 => Some(1968),
        16 => Some(123),
        _ => None,
    }
}

impl ModbusGroup {
    pub fn from_block(block: &BlockDescriptor, tags: usize) -> Result<Self, GroupError> {
        let props: GroupProperties =
            serde_json::from_value(serde_json::Value::Object(block.properties.clone())).map_err(
                |e| GroupError::Properties {
                    block: block.id.clone(),
                    reason: e.to_string(),
                },
            )?;

        if props.unit_id > 247 {
            return Err(GroupError::UnitId {
                block: block.id.clone(),
                unit_id: props.unit_id,
            });
        }
        let max = max_count(props.func_code).ok_or_else(|| GroupError::FunctionCode {
            block: block.id.clone(),
            func_code: props.func_code,
        })?;
        if props.count == 0 || props.count > max {
            return Err(GroupError::Count {
                block: block.id.clone(),
                func_code: props.func_code,
                count: props.count,
                max,
            });
        }

        let is_read = matches!(props.func_code, 1..=4);
        Ok(Self {
            block_id: block.id.clone(),
            unit_id: props.unit_id as u8,
            func_code: props.func_code,
            address: props.address,
            count: props.count,
            period: block.period(),
            polled: is_read && block.trigger == TriggerMode::Cyclic && block.direction != Direction::Write,
            tags,
        })
    }
}

/// Polling schedule; due times survive a hot reload for blocks that still exist
#[derive(Debug, Default)]
pub struct Schedule {
    entries: Vec<(ModbusGroup, Instant)>,
}

impl Schedule {
    pub fn replace(&mut self, groups: Vec<ModbusGroup>) {
        let now = Instant::now();
        let previous = std::mem::take(&mut self.entries);
        self.entries = groups
            .into_iter()
            .map(|g| {
                let due = previous
                    .iter()
                    .find(|(old, _)| old.block_id == g.block_id)
                    .map(|(_, due)| *due)
                    .unwrap_or(now);
                (g, due)
            })
            .collect();
    }

    pub fn groups(&self) -> impl Iterator<Item = &ModbusGroup> {
        self.entries.iter().map(|(g, _)| g)
    }

    /// Polled groups whose period has elapsed; their next due time is pushed forward
    pub fn take_due(&mut self, now: Instant) -> Vec<ModbusGroup> {
        let mut due = Vec::new();
        for (group, next) in self.entries.iter_mut() {
            if group.polled && *next <= now {
                *next = now + group.period;
                due.push(group.clone());
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::PropertyMap;
    use serde_json::json;

    fn block(id: &str, props: serde_json::Value) -> BlockDescriptor {
        let properties: PropertyMap = match props {
            serde_json::Value::Object(map) => map,
            _ => PropertyMap::new(),
        };
        BlockDescriptor {
            id: id.into(),
            connection_id: "mtc-01".into(),
            enabled: true,
            direction: Direction::Read,
            trigger: TriggerMode::Cyclic,
            period_s: 1.0,
            properties,
        }
    }

    #[test]
    fn test_defaults() {
        let g = ModbusGroup::from_block(&block("b1", json!({})), 0).unwrap();
        assert_eq!((g.unit_id, g.func_code, g.address, g.count), (1, 3, 0, 1));
        assert!(g.polled);
    }

    #[test]
    fn test_validation() {
        let err = ModbusGroup::from_block(&block("b1", json!({"unit_id": 300})), 0).unwrap_err();
        assert!(matches!(err, GroupError::UnitId { unit_id: 300, .. }));

        let err = ModbusGroup::from_block(&block("b1", json!({"func_code": 7})), 0).unwrap_err();
        assert!(matches!(err, GroupError::FunctionCode { func_code: 7, .. }));

        let err = ModbusGroup::from_block(&block("b1", json!({"count": 200})), 0).unwrap_err();
        assert!(matches!(err, GroupError::Count { max: 125, .. }));

        let err = ModbusGroup::from_block(&block("b1", json!({"address": "x"})), 0).unwrap_err();
        assert!(matches!(err, GroupError::Properties { .. }));
    }

    #[test]
    fn test_write_functions_are_not_polled() {
        let g = ModbusGroup::from_block(&block("b1", json!({"func_code": 16, "count": 4})), 0)
            .unwrap();
        assert!(!g.polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_keeps_due_times_across_reload() {
        let mut schedule = Schedule::default();
        let g1 = ModbusGroup::from_block(&block("b1", json!({})), 0).unwrap();
        schedule.replace(vec![g1.clone()]);
        assert_eq!(schedule.take_due(Instant::now()).len(), 1);
        assert!(schedule.take_due(Instant::now()).is_empty());

        let g2 = ModbusGroup::from_block(&block("b2", json!({})), 0).unwrap();
        schedule.replace(vec![g1, g2]);
        let due = schedule.take_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].block_id, "b2");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(schedule.take_due(Instant::now()).len(), 2);
    }
}
