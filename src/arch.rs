//! Architecture descriptor: memory map, known functions and analysis options.
//!
//! The descriptor is built once and handed to the decompiler; every pass reads
//! it, none writes it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{Address, DecompilerError};

/// How loop back edges are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoopHeuristic {
    /// Edge `tail -> header` where `header` dominates `tail`
    Dominance,
    /// Edge `tail -> header` where `header.start <= tail.start`
    AddressOrder,
}

/// Maps a call-target prefix to the API class used in annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPrefix {
    pub prefix: String,
    pub class: String,
}

/// A memory-mapped peripheral register window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRegion {
    pub name: String,
    pub base: Address,
    pub size: u32,
}

impl PeripheralRegion {
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && (address - self.base) < self.size
    }
}

/// Tunables for discovery and analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Discovery stops once this many functions exist
    pub max_functions: usize,
    /// Size of the last function when no later candidate bounds it
    pub last_function_window: u32,
    pub loop_heuristic: LoopHeuristic,
    /// Minimum run of printable ASCII reported by string extraction
    pub min_string_length: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_functions: 100,
            last_function_window: 0x1000,
            loop_heuristic: LoopHeuristic::Dominance,
            min_string_length: 5,
        }
    }
}

/// Memory map and symbol knowledge for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    /// Human-readable target name
    pub name: String,
    /// Address at which byte 0 of the image is mapped
    pub flash_base: Address,
    pub flash_size: u32,
    pub ram_base: Address,
    pub ram_size: u32,
    /// Reset entry; defaults to the flash base
    pub entry_point: Option<Address>,
    /// Known library functions, name to address
    pub known_functions: BTreeMap<String, Address>,
    /// Call-target prefixes recognized by API detection, in priority order
    pub api_prefixes: Vec<ApiPrefix>,
    pub peripherals: Vec<PeripheralRegion>,
    pub analysis: AnalysisOptions,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self::esp32()
    }
}

impl ArchitectureConfig {
    /// Descriptor for an ESP32 application image in instruction flash.
    pub fn esp32() -> Self {
        let known_functions = [
            ("ets_delay_us", 0x4000_8534),
            ("ets_printf", 0x4000_7d54),
            ("gpio_set_direction", 0x4000_9000),
            ("gpio_set_level", 0x4000_9040),
            ("gpio_get_level", 0x4000_9080),
            ("gpio_isr_handler_add", 0x4000_90c0),
            ("uart_write_bytes", 0x4000_a000),
            ("uart_read_bytes", 0x4000_a040),
            ("esp_wifi_connect", 0x4000_b000),
            ("esp_intr_alloc", 0x4000_c000),
            ("xTaskCreate", 0x4000_d000),
            ("xTaskCreatePinnedToCore", 0x4000_d040),
            ("vTaskDelay", 0x4000_d080),
            ("vTaskDelete", 0x4000_d0c0),
            ("xQueueSend", 0x4000_e000),
            ("xQueueReceive", 0x4000_e040),
            ("printf", 0x4000_f000),
        ]
        .into_iter()
        .map(|(name, addr)| (name.to_string(), addr))
        .collect();

        let api_prefixes = [
            ("gpio_isr_", "ESP32 Interrupt API"),
            ("esp_intr_", "ESP32 Interrupt API"),
            ("gpio_", "ESP32 GPIO API"),
            ("uart_", "ESP32 UART API"),
            ("esp_wifi_", "ESP32 WiFi API"),
            ("ets_", "ESP32 ROM API"),
            ("xTask", "FreeRTOS Task API"),
            ("vTask", "FreeRTOS Task API"),
            ("xQueue", "FreeRTOS Queue API"),
            ("printf", "libc"),
        ]
        .into_iter()
        .map(|(prefix, class)| ApiPrefix {
            prefix: prefix.to_string(),
            class: class.to_string(),
        })
        .collect();

        let peripherals = [
            ("UART", 0x3ff4_0000, 0x1000),
            ("GPIO", 0x3ff4_4000, 0x1000),
            ("RTC", 0x3ff4_8000, 0x1000),
            ("TIMER", 0x3ff5_f000, 0x1000),
        ]
        .into_iter()
        .map(|(name, base, size)| PeripheralRegion {
            name: name.to_string(),
            base,
            size,
        })
        .collect();

        Self {
            name: "ESP32".to_string(),
            flash_base: 0x400d_0000,
            flash_size: 0x0040_0000,
            ram_base: 0x3ffb_0000,
            ram_size: 0x0005_0000,
            entry_point: None,
            known_functions,
            api_prefixes,
            peripherals,
            analysis: AnalysisOptions::default(),
        }
    }

    /// Load a descriptor from JSON; missing fields take the ESP32 defaults.
    pub fn from_json_str(json: &str) -> Result<Self, DecompilerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DecompilerError::Config(format!("JSON parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a descriptor from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DecompilerError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<(), DecompilerError> {
        if self.flash_base % 4 != 0 {
            return Err(DecompilerError::Config(format!(
                "flash base 0x{:08x} is not word aligned",
                self.flash_base
            )));
        }
        if self.analysis.max_functions == 0 {
            return Err(DecompilerError::Config(
                "max_functions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured reset entry
    pub fn entry(&self) -> Address {
        self.entry_point.unwrap_or(self.flash_base)
    }

    /// Reverse lookup of the known-function table
    pub fn symbol_at(&self, address: Address) -> Option<&str> {
        self.known_functions
            .iter()
            .find(|(_, &addr)| addr == address)
            .map(|(name, _)| name.as_str())
    }

    /// API class of a call target, first matching prefix wins
    pub fn api_class(&self, target: &str) -> Option<&str> {
        self.api_prefixes
            .iter()
            .find(|p| target.starts_with(&p.prefix))
            .map(|p| p.class.as_str())
    }

    pub fn peripheral_at(&self, address: Address) -> Option<&PeripheralRegion> {
        self.peripherals.iter().find(|p| p.contains(address))
    }

    /// True if `address` lies in the configured RAM window
    pub fn is_ram_address(&self, address: Address) -> bool {
        address >= self.ram_base && (address - self.ram_base) < self.ram_size
    }
}
