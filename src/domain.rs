use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DataError;

pub const DEFAULT_NUMBERS_PER: u32 = 100_000;
pub const GRAND_TOTAL: &str = "Grand Total";
pub const GOLDEN_JUBILEE: &str = "The Golden Jubilee National Hospital";
pub const UK_KEY: &str = "UK";

pub type EntityName = String;

/// Opaque token identifying the snapshot of a remote source that is on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionMarker(String);

impl RevisionMarker {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RevisionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Population divided by the normalisation constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    pub fn from_population(population: f64, numbers_per: u32) -> Self {
        Self(population / f64::from(numbers_per))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// `None` when the population is zero, so no value is ever divided by it.
    pub fn apply(self, raw: f64) -> Option<f64> {
        (self.0 > 0.0 && self.0.is_finite()).then(|| raw / self.0)
    }
}

impl std::ops::Add for ScaleFactor {
    type Output = ScaleFactor;

    fn add(self, rhs: Self) -> Self::Output {
        ScaleFactor(self.0 + rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Scotland,
    Uk,
    Mobility,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Scotland, SourceId::Uk, SourceId::Mobility];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::Scotland => "scotland",
            SourceId::Uk => "uk",
            SourceId::Mobility => "mobility",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scotland" => Ok(SourceId::Scotland),
            "uk" => Ok(SourceId::Uk),
            "mobility" => Ok(SourceId::Mobility),
            _ => Err(DataError::UnknownSource(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Nation {
    England,
    Scotland,
    Wales,
    NorthernIreland,
    Uk,
}

impl Nation {
    /// The four constituent nations, in report column order.
    pub const CONSTITUENTS: [Nation; 4] = [
        Nation::England,
        Nation::Scotland,
        Nation::Wales,
        Nation::NorthernIreland,
    ];

    pub const ALL: [Nation; 5] = [
        Nation::England,
        Nation::Scotland,
        Nation::Wales,
        Nation::NorthernIreland,
        Nation::Uk,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Nation::England => "England",
            Nation::Scotland => "Scotland",
            Nation::Wales => "Wales",
            Nation::NorthernIreland => "Northern Ireland",
            Nation::Uk => UK_KEY,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Nation::England => "england",
            Nation::Scotland => "scotland",
            Nation::Wales => "wales",
            Nation::NorthernIreland => "northern-ireland",
            Nation::Uk => "uk",
        }
    }

    /// Approximate populations used as fixed scale inputs.
    pub fn population(self) -> f64 {
        match self {
            Nation::England => 54_000_000.0,
            Nation::Scotland => 5_500_000.0,
            Nation::Wales => 3_100_000.0,
            Nation::NorthernIreland => 2_000_000.0,
            Nation::Uk => 64_600_000.0,
        }
    }

    pub fn scale(self, numbers_per: u32) -> ScaleFactor {
        ScaleFactor::from_population(self.population(), numbers_per)
    }
}

impl fmt::Display for Nation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Nation {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        match normalized.as_str() {
            "england" => Ok(Nation::England),
            "scotland" => Ok(Nation::Scotland),
            "wales" => Ok(Nation::Wales),
            "northern ireland" => Ok(Nation::NorthernIreland),
            "uk" | "united kingdom" => Ok(Nation::Uk),
            _ => Err(DataError::UnknownNation(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Later start and earlier end; `None` when the windows do not overlap.
    pub fn intersection(self, other: DateWindow) -> Option<DateWindow> {
        DateWindow::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Earliest start and latest end over every window given.
    pub fn union<I>(windows: I) -> Option<DateWindow>
    where
        I: IntoIterator<Item = Option<DateWindow>>,
    {
        windows.into_iter().flatten().reduce(|acc, window| DateWindow {
            start: acc.start.min(window.start),
            end: acc.end.max(window.end),
        })
    }

    pub fn days(self) -> impl Iterator<Item = NaiveDate> {
        self.start
            .iter_days()
            .take_while(move |date| *date <= self.end)
    }
}

/// Date-ordered series; each date appears at most once and gaps are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateSeries<T> {
    points: BTreeMap<NaiveDate, T>,
}

impl<T> Default for DateSeries<T> {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }
}

impl<T> DateSeries<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the value for `date`, returning the old one.
    pub fn insert(&mut self, date: NaiveDate, value: T) -> Option<T> {
        self.points.insert(date, value)
    }

    pub fn get(&self, date: NaiveDate) -> Option<&T> {
        self.points.get(&date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.points.contains_key(&date)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.keys().next_back().copied()
    }

    pub fn window(&self) -> Option<DateWindow> {
        DateWindow::new(self.first_date()?, self.last_date()?)
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.points.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, NaiveDate, T> {
        self.points.iter()
    }

    /// Date-keyed overwrite: every point of `other` replaces or extends `self`.
    pub fn overlay(&mut self, other: DateSeries<T>) {
        self.points.extend(other.points);
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> DateSeries<U> {
        DateSeries {
            points: self
                .points
                .iter()
                .map(|(date, value)| (*date, f(value)))
                .collect(),
        }
    }

    /// Human-readable coverage, e.g. `2020-03-01 to 2020-06-30`.
    pub fn coverage(&self) -> String {
        match (self.first_date(), self.last_date()) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "no dates".to_string(),
        }
    }
}

impl<T> FromIterator<(NaiveDate, T)> for DateSeries<T> {
    fn from_iter<I: IntoIterator<Item = (NaiveDate, T)>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for DateSeries<T> {
    type Item = (NaiveDate, T);
    type IntoIter = btree_map::IntoIter<NaiveDate, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a DateSeries<T> {
    type Item = (&'a NaiveDate, &'a T);
    type IntoIter = btree_map::Iter<'a, NaiveDate, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

/// One date's values for every entity of a geography, plus the Grand Total.
///
/// An entity without a value is `None`, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityValues<T = f64> {
    pub values: BTreeMap<EntityName, Option<T>>,
    pub grand_total: Option<T>,
}

impl<T: Copy + Sum<T>> EntityValues<T> {
    pub fn new(values: BTreeMap<EntityName, Option<T>>) -> Self {
        let mut record = Self {
            values,
            grand_total: None,
        };
        record.recompute_total();
        record
    }

    /// Grand Total is the sum of the present entity values; `None` when no
    /// entity has a value.
    pub fn recompute_total(&mut self) {
        let present: Vec<T> = self.values.values().flatten().copied().collect();
        self.grand_total = if present.is_empty() {
            None
        } else {
            Some(present.into_iter().sum())
        };
    }

    /// Looks up an entity value; `Grand Total` resolves to the total.
    pub fn get(&self, name: &str) -> Option<T> {
        if name == GRAND_TOTAL {
            return self.grand_total;
        }
        self.values.get(name).copied().flatten()
    }

    pub fn has_any_value(&self) -> bool {
        self.values.values().any(Option::is_some)
    }
}

pub type CaseRecord = EntityValues<f64>;
pub type DeathRecord = EntityValues<f64>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub total_positive: Option<i64>,
    pub total_negative: Option<i64>,
    pub daily_positive: Option<i64>,
    pub daily_negative: Option<i64>,
    pub positive_rate: Option<f64>,
}

impl TestRecord {
    /// Positive share of the day's tests; `None` without both terms or with
    /// no tests at all.
    pub fn positivity(daily_positive: Option<i64>, daily_negative: Option<i64>) -> Option<f64> {
        let (positive, negative) = (daily_positive?, daily_negative?);
        let tested = positive + negative;
        (tested != 0).then(|| positive as f64 / tested as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Measure {
    Cases,
    Deaths,
}

impl Measure {
    pub const ALL: [Measure; 2] = [Measure::Cases, Measure::Deaths];

    pub fn as_str(self) -> &'static str {
        match self {
            Measure::Cases => "cases",
            Measure::Deaths => "deaths",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Measure::Cases => "Cases",
            Measure::Deaths => "Deaths",
        }
    }
}

/// Per nation, per date. Every field is independently nullable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NationTotals {
    pub daily_cases: Option<f64>,
    pub daily_deaths: Option<f64>,
    pub cumulative_cases: Option<f64>,
    pub cumulative_deaths: Option<f64>,
    pub tests: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityCategory {
    RetailAndRecreation,
    GroceryAndPharmacy,
    Parks,
    TransitStations,
    Workplaces,
    Residential,
}

impl MobilityCategory {
    pub const ALL: [MobilityCategory; 6] = [
        MobilityCategory::RetailAndRecreation,
        MobilityCategory::GroceryAndPharmacy,
        MobilityCategory::Parks,
        MobilityCategory::TransitStations,
        MobilityCategory::Workplaces,
        MobilityCategory::Residential,
    ];

    pub fn index(self) -> usize {
        match self {
            MobilityCategory::RetailAndRecreation => 0,
            MobilityCategory::GroceryAndPharmacy => 1,
            MobilityCategory::Parks => 2,
            MobilityCategory::TransitStations => 3,
            MobilityCategory::Workplaces => 4,
            MobilityCategory::Residential => 5,
        }
    }

    /// Column name prefix in the upstream file.
    pub fn column_prefix(self) -> &'static str {
        match self {
            MobilityCategory::RetailAndRecreation => "retail_and_recreation",
            MobilityCategory::GroceryAndPharmacy => "grocery_and_pharmacy",
            MobilityCategory::Parks => "parks",
            MobilityCategory::TransitStations => "transit_stations",
            MobilityCategory::Workplaces => "workplaces",
            MobilityCategory::Residential => "residential",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            MobilityCategory::RetailAndRecreation => "Retail & recreation",
            MobilityCategory::GroceryAndPharmacy => "Grocery & pharmacy",
            MobilityCategory::Parks => "Parks",
            MobilityCategory::TransitStations => "Transit stations",
            MobilityCategory::Workplaces => "Workplaces",
            MobilityCategory::Residential => "Residential",
        }
    }
}

/// Percent change from the pre-pandemic baseline for the six categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MobilityVector(pub [Option<f64>; 6]);

impl MobilityVector {
    pub fn get(&self, category: MobilityCategory) -> Option<f64> {
        self.0[category.index()]
    }

    /// Component-wise `self - other`; absent where either side is absent.
    pub fn difference(&self, other: &MobilityVector) -> MobilityVector {
        let mut out = [None; 6];
        for (slot, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *slot = a.zip(*b).map(|(a, b)| a - b);
        }
        MobilityVector(out)
    }
}
