// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! Interface cards and their ports.
//!
//! Sub-module (WIC) ports live in a window of 16 ports per slot, starting at
//! `16 * (slot + 1)`, so they never collide with the card's own interfaces.

use crate::error::{LoomError, Result};
use crate::nio::Nio;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

pub const PORTS_PER_SLOT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Ethernet,
    Serial,
    /// Fixed router motherboard. Only hosts sub-module slots.
    Motherboard,
}

impl AdapterKind {
    pub const fn removable(&self) -> bool {
        !matches!(self, AdapterKind::Motherboard)
    }
}

/// A pluggable interface module, e.g. a WIC-2T.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubModule {
    pub name: String,
    pub port_count: u32,
}

impl SubModule {
    pub fn new(name: impl Into<String>, port_count: u32) -> Self {
        Self {
            name: name.into(),
            port_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    kind: AdapterKind,
    ports: BTreeMap<u32, Option<Nio>>,
    slots: Vec<Option<SubModule>>,
}

impl Adapter {
    pub fn new(kind: AdapterKind, interface_count: u32, slot_count: u32) -> Self {
        Self {
            kind,
            ports: (0..interface_count).map(|n| (n, None)).collect(),
            slots: vec![None; slot_count as usize],
        }
    }

    pub fn ethernet(interface_count: u32) -> Self {
        Self::new(AdapterKind::Ethernet, interface_count, 0)
    }

    pub fn motherboard(slot_count: u32) -> Self {
        Self::new(AdapterKind::Motherboard, 0, slot_count)
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn removable(&self) -> bool {
        self.kind.removable()
    }

    pub fn port_exists(&self, port: u32) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.keys().copied()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&SubModule> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn slot_range(slot: usize, port_count: u32) -> Range<u32> {
        let base = PORTS_PER_SLOT * (slot as u32 + 1);
        base..base + port_count
    }

    pub fn install_submodule(&mut self, slot: usize, module: SubModule) -> Result<()> {
        let current = self
            .slots
            .get(slot)
            .ok_or_else(|| LoomError::not_found("sub-module slot", slot))?;
        if let Some(existing) = current {
            return Err(LoomError::conflict(format!(
                "slot {} already holds {}",
                slot, existing.name
            )));
        }
        if module.port_count > PORTS_PER_SLOT {
            return Err(LoomError::InvalidArgument(format!(
                "{} declares {} ports, a slot holds at most {}",
                module.name, module.port_count, PORTS_PER_SLOT
            )));
        }

        let range = Self::slot_range(slot, module.port_count);
        if let Some(taken) = range.clone().find(|p| self.ports.contains_key(p)) {
            return Err(LoomError::conflict(format!(
                "port {} already exists, cannot install {} in slot {}",
                taken, module.name, slot
            )));
        }

        for port in range {
            self.ports.insert(port, None);
        }
        self.slots[slot] = Some(module);
        Ok(())
    }

    pub fn uninstall_submodule(&mut self, slot: usize) -> Result<SubModule> {
        let port_count = self
            .slots
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|m| m.port_count)
            .ok_or_else(|| LoomError::not_found("sub-module", format!("slot {}", slot)))?;

        let range = Self::slot_range(slot, port_count);
        if let Some(bound) = range
            .clone()
            .find(|p| matches!(self.ports.get(p), Some(Some(_))))
        {
            return Err(LoomError::conflict(format!(
                "port {} of slot {} is still connected",
                bound, slot
            )));
        }

        for port in range {
            self.ports.remove(&port);
        }
        self.slots[slot]
            .take()
            .ok_or_else(|| LoomError::not_found("sub-module", format!("slot {}", slot)))
    }

    pub fn bind_nio(&mut self, port: u32, nio: Nio) -> Result<()> {
        let slot = self
            .ports
            .get_mut(&port)
            .ok_or_else(|| LoomError::not_found("port", port))?;
        if slot.is_some() {
            return Err(LoomError::conflict(format!("port {} is already bound", port)));
        }
        *slot = Some(nio);
        Ok(())
    }

    pub fn unbind_nio(&mut self, port: u32) -> Result<Option<Nio>> {
        self.ports
            .get_mut(&port)
            .map(Option::take)
            .ok_or_else(|| LoomError::not_found("port", port))
    }

    pub fn nio(&self, port: u32) -> Result<Option<&Nio>> {
        self.ports
            .get(&port)
            .map(Option::as_ref)
            .ok_or_else(|| LoomError::not_found("port", port))
    }

    pub fn nio_mut(&mut self, port: u32) -> Result<Option<&mut Nio>> {
        self.ports
            .get_mut(&port)
            .map(Option::as_mut)
            .ok_or_else(|| LoomError::not_found("port", port))
    }

    /// Drops every binding, keeping the port layout.
    pub fn clear_nios(&mut self) {
        for nio in self.ports.values_mut() {
            *nio = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nio::NioKind;

    #[test]
    fn ports_are_numbered_from_zero() {
        let a = Adapter::ethernet(4);
        assert_eq!(a.ports().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(a.port_exists(3));
        assert!(!a.port_exists(4));
        assert!(a.removable());
    }

    #[test]
    fn submodule_allocates_its_window() {
        for slot in 0..3usize {
            for count in [1u32, 2, 4, 16] {
                let mut a = Adapter::motherboard(3);
                a.install_submodule(slot, SubModule::new("WIC", count)).unwrap();
                let base = 16 * (slot as u32 + 1);
                let expected: Vec<u32> = (base..base + count).collect();
                assert_eq!(a.ports().collect::<Vec<_>>(), expected);

                a.uninstall_submodule(slot).unwrap();
                assert_eq!(a.ports().count(), 0);
                assert!(a.slot(slot).is_none());
            }
        }
    }

    #[test]
    fn one_module_per_slot() {
        let mut a = Adapter::motherboard(2);
        a.install_submodule(0, SubModule::new("WIC-1T", 1)).unwrap();
        let err = a.install_submodule(0, SubModule::new("WIC-2T", 2)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(a.slot(0).unwrap().name, "WIC-1T");
    }

    #[test]
    fn missing_slot_and_empty_slot() {
        let mut a = Adapter::motherboard(1);
        assert!(a.install_submodule(5, SubModule::new("WIC", 1)).unwrap_err().is_not_found());
        assert!(a.uninstall_submodule(0).unwrap_err().is_not_found());
    }

    #[test]
    fn colliding_range_is_rejected_without_side_effects() {
        let mut a = Adapter::new(AdapterKind::Ethernet, 20, 1);
        let err = a.install_submodule(0, SubModule::new("WIC", 2)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(a.ports().count(), 20);
    }

    #[test]
    fn uninstall_refuses_bound_ports() {
        let mut a = Adapter::motherboard(1);
        a.install_submodule(0, SubModule::new("WIC-2T", 2)).unwrap();
        a.bind_nio(17, Nio::new(NioKind::Null)).unwrap();
        assert!(a.uninstall_submodule(0).unwrap_err().is_conflict());
        a.unbind_nio(17).unwrap();
        a.uninstall_submodule(0).unwrap();
    }

    #[test]
    fn nio_binding() {
        let mut a = Adapter::ethernet(2);
        assert!(a.bind_nio(9, Nio::new(NioKind::Null)).unwrap_err().is_not_found());
        a.bind_nio(1, Nio::udp(1, "h", 2)).unwrap();
        assert!(a.bind_nio(1, Nio::new(NioKind::Null)).unwrap_err().is_conflict());
        assert_eq!(a.nio(1).unwrap().and_then(|n| n.udp_port()), Some(1));
        assert!(a.unbind_nio(1).unwrap().is_some());
        assert!(a.nio(1).unwrap().is_none());
        assert!(a.nio(7).is_err());
    }

    #[test]
    fn layout_survives_serialization() {
        let mut a = Adapter::motherboard(2);
        a.install_submodule(1, SubModule::new("WIC-1T", 1)).unwrap();
        let json = serde_json::to_string(&a).unwrap();
        let back: Adapter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(back.port_exists(32));
    }
}
