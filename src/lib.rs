//! Scottish and UK COVID-19 time series: download, normalise per head of
//! population, derive display tables and emit CSV, chart and page data.

pub mod app;
pub mod chart;
pub mod config;
pub mod csv_util;
pub mod domain;
pub mod error;
pub mod export;
pub mod fetch;
pub mod metrics;
pub mod mobility;
pub mod national;
pub mod output;
pub mod package;
pub mod page;
pub mod regional;
pub mod state;
pub mod store;
