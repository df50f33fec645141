//! Resource management - Container resource specs and resize requests

use serde::{Deserialize, Serialize};

use super::error::{VpsError, VpsResult};

/// RAM, CPU and root-disk size requested for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory limit in GB
    pub ram_gb: u32,
    /// Number of CPU cores
    pub cpu_cores: u32,
    /// Root disk size in GB
    pub storage_gb: u32,
}

impl ResourceSpec {
    pub fn new(ram_gb: u32, cpu_cores: u32, storage_gb: u32) -> Self {
        Self {
            ram_gb,
            cpu_cores,
            storage_gb,
        }
    }

    /// Replace the storage size
    pub fn with_storage(mut self, storage_gb: u32) -> Self {
        self.storage_gb = storage_gb;
        self
    }

    /// Reject any non-positive dimension
    pub fn validate(&self) -> VpsResult<()> {
        if self.ram_gb == 0 || self.cpu_cores == 0 || self.storage_gb == 0 {
            return Err(VpsError::InvalidSpec(
                "RAM, CPU, and storage must be positive integers".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory limit expressed in MB, as the runtime expects it
    pub fn memory_mb(&self) -> u64 {
        gb_to_mb(self.ram_gb)
    }
}

impl std::fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}GB RAM, {} CPU cores, {}GB storage",
            self.ram_gb, self.cpu_cores, self.storage_gb
        )
    }
}

pub fn gb_to_mb(gb: u32) -> u64 {
    gb as u64 * 1024
}

/// A resizable dimension of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Ram,
    Cpu,
    Storage,
}

impl Dimension {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ram => "RAM",
            Self::Cpu => "CPU",
            Self::Storage => "Disk",
        }
    }
}

/// Dimensions to change; `None` leaves a dimension untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeRequest {
    pub ram_gb: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub storage_gb: Option<u32>,
}

impl ResizeRequest {
    pub fn with_ram(mut self, ram_gb: u32) -> Self {
        self.ram_gb = Some(ram_gb);
        self
    }

    pub fn with_cpu(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = Some(cpu_cores);
        self
    }

    pub fn with_storage(mut self, storage_gb: u32) -> Self {
        self.storage_gb = Some(storage_gb);
        self
    }

    /// Check if any dimension is requested
    pub fn is_empty(&self) -> bool {
        self.ram_gb.is_none() && self.cpu_cores.is_none() && self.storage_gb.is_none()
    }

    /// Requested dimensions in application order
    pub fn dimensions(&self) -> Vec<(Dimension, u32)> {
        [
            (Dimension::Ram, self.ram_gb),
            (Dimension::Cpu, self.cpu_cores),
            (Dimension::Storage, self.storage_gb),
        ]
        .into_iter()
        .filter_map(|(dim, value)| value.map(|v| (dim, v)))
        .collect()
    }

    pub fn validate(&self) -> VpsResult<()> {
        if self.is_empty() {
            return Err(VpsError::InvalidSpec(
                "specify at least one of RAM, CPU, or storage".to_string(),
            ));
        }
        if let Some((dim, _)) = self.dimensions().into_iter().find(|(_, v)| *v == 0) {
            return Err(VpsError::InvalidSpec(format!(
                "{} must be a positive integer",
                dim.label()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(ResourceSpec::new(4, 1, 20).validate().is_ok());
        assert!(matches!(
            ResourceSpec::new(0, 1, 20).validate(),
            Err(VpsError::InvalidSpec(_))
        ));
        assert!(ResourceSpec::new(4, 1, 0).validate().is_err());
    }

    #[test]
    fn memory_is_rendered_in_megabytes() {
        assert_eq!(ResourceSpec::new(4, 1, 20).memory_mb(), 4096);
    }

    #[test]
    fn resize_dimensions_keep_order() {
        let req = ResizeRequest::default().with_storage(50).with_ram(8);
        assert_eq!(
            req.dimensions(),
            vec![(Dimension::Ram, 8), (Dimension::Storage, 50)]
        );
        assert!(req.validate().is_ok());
    }

    #[test]
    fn empty_or_zero_resize_is_invalid() {
        assert!(ResizeRequest::default().validate().is_err());
        assert!(ResizeRequest::default().with_cpu(0).validate().is_err());
    }
}
