//! Per-package-type routing policy negotiated during the handshake.
//!
//! Each side owns a [`RoutingTable`] mapping package types to a [`Route`]
//! and a [`RouteKind`]. On connect the server merges the client's table
//! into its own with [`RoutingTable::accept`]:
//!
//! | server    | client    | result                          |
//! |-----------|-----------|---------------------------------|
//! | Required  | Required  | same route, or reject if differ |
//! | Required  | Optional  | server route, Required          |
//! | Optional  | Required  | client route, Required          |
//! | Optional  | Optional  | client route, Optional          |
//!
//! # Example
//!
//! ```
//! use ioservice::routing::{Route, RouteKind, RoutingTable};
//!
//! let mut server = RoutingTable::new(Route::new(1), RouteKind::Optional);
//! server.add_route(2, Route::new(2), RouteKind::Required);
//!
//! let client = RoutingTable::new(Route::new(3), RouteKind::Optional);
//! let merged = server.accept(&client).unwrap();
//!
//! assert_eq!(merged.find_route(2), Route::new(2));
//! assert_eq!(merged.find_route(100), Route::new(3));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Opaque route name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route(u32);

impl Route {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

/// Whether a side insists on its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteKind {
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RouteEntry {
    route: Route,
    kind: RouteKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RangeEntry {
    begin: u32,
    end: u32,
    entry: RouteEntry,
}

/// Routing policy for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    default: RouteEntry,
    types: BTreeMap<u32, RouteEntry>,
    ranges: Vec<RangeEntry>,
}

impl RoutingTable {
    /// Table where every type uses `default_route`.
    pub fn new(default_route: Route, kind: RouteKind) -> Self {
        Self {
            default: RouteEntry {
                route: default_route,
                kind,
            },
            types: BTreeMap::new(),
            ranges: Vec::new(),
        }
    }

    /// Route a single package type.
    pub fn add_route(&mut self, package_type: u32, route: Route, kind: RouteKind) -> &mut Self {
        self.types.insert(package_type, RouteEntry { route, kind });
        self
    }

    /// Route every type in `begin..=end`.
    ///
    /// Ranges added earlier win when they overlap.
    pub fn add_route_range(
        &mut self,
        begin: u32,
        end: u32,
        route: Route,
        kind: RouteKind,
    ) -> &mut Self {
        let (begin, end) = if begin <= end { (begin, end) } else { (end, begin) };
        self.ranges.push(RangeEntry {
            begin,
            end,
            entry: RouteEntry { route, kind },
        });
        self
    }

    /// Route for `package_type`: exact entry, then range, then default.
    pub fn find_route(&self, package_type: u32) -> Route {
        self.find_entry(package_type).route
    }

    /// Kind of the entry that decides `package_type`.
    pub fn find_kind(&self, package_type: u32) -> RouteKind {
        self.find_entry(package_type).kind
    }

    fn find_entry(&self, package_type: u32) -> RouteEntry {
        if let Some(entry) = self.types.get(&package_type) {
            return *entry;
        }
        self.ranges
            .iter()
            .find(|r| r.begin <= package_type && package_type <= r.end)
            .map(|r| r.entry)
            .unwrap_or(self.default)
    }

    fn covered_by_range(&self, package_type: u32) -> bool {
        self.ranges
            .iter()
            .any(|r| r.begin <= package_type && package_type <= r.end)
    }

    /// Merge a client's table into this one.
    ///
    /// Returns `None` when both sides require different routes for any type.
    pub fn accept(&self, client: &RoutingTable) -> Option<RoutingTable> {
        let default = merge(self.default, client.default)?;
        let mut merged = RoutingTable {
            default,
            types: BTreeMap::new(),
            ranges: Vec::new(),
        };

        let exact: BTreeSet<u32> = self.types.keys().chain(client.types.keys()).copied().collect();
        for &package_type in &exact {
            let entry = merge(self.find_entry(package_type), client.find_entry(package_type))?;
            merged.types.insert(package_type, entry);
        }

        // Split every range into intervals on which both tables are constant
        let mut bounds: BTreeSet<u64> = BTreeSet::new();
        for r in self.ranges.iter().chain(client.ranges.iter()) {
            bounds.insert(r.begin as u64);
            bounds.insert(r.end as u64 + 1);
        }
        for &t in &exact {
            bounds.insert(t as u64);
            bounds.insert(t as u64 + 1);
        }

        let bounds: Vec<u64> = bounds.into_iter().collect();
        for pair in bounds.windows(2) {
            let begin = pair[0] as u32;
            let end = (pair[1] - 1) as u32;
            if !(self.covered_by_range(begin) || client.covered_by_range(begin)) {
                continue;
            }
            if begin == end && exact.contains(&begin) {
                continue;
            }
            let entry = merge(self.find_entry(begin), client.find_entry(begin))?;
            merged.ranges.push(RangeEntry { begin, end, entry });
        }

        Some(merged)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(Route::new(0), RouteKind::Optional)
    }
}

fn merge(server: RouteEntry, client: RouteEntry) -> Option<RouteEntry> {
    use RouteKind::*;
    match (server.kind, client.kind) {
        (Required, Required) if server.route != client.route => None,
        (Required, _) => Some(server),
        (_, Required) => Some(client),
        (Optional, Optional) => Some(client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RouteKind::{Optional, Required};

    const FIRST: Route = Route::new(1);
    const SECOND: Route = Route::new(2);
    const THIRD: Route = Route::new(3);

    const FIRST_TYPE: u32 = 1;
    const SECOND_TYPE: u32 = 2;
    const THIRD_TYPE: u32 = 3;
    const RANGE_BEGIN: u32 = 4;
    const RANGE_TYPE: u32 = 6;
    const RANGE_END: u32 = 10;
    const SOME_TYPE: u32 = 100;

    fn server_table() -> RoutingTable {
        let mut table = RoutingTable::new(FIRST, Optional);
        table
            .add_route(FIRST_TYPE, FIRST, Optional)
            .add_route(SECOND_TYPE, SECOND, Required)
            .add_route(THIRD_TYPE, THIRD, Optional)
            .add_route_range(RANGE_BEGIN, RANGE_END, SECOND, Required);
        table
    }

    fn routes(table: &RoutingTable) -> [Route; 5] {
        [
            table.find_route(SOME_TYPE),
            table.find_route(FIRST_TYPE),
            table.find_route(SECOND_TYPE),
            table.find_route(THIRD_TYPE),
            table.find_route(RANGE_TYPE),
        ]
    }

    #[test]
    fn test_find_route() {
        let table = server_table();
        assert_eq!(routes(&table), [FIRST, FIRST, SECOND, THIRD, SECOND]);
        assert_eq!(table.find_route(RANGE_BEGIN), SECOND);
        assert_eq!(table.find_route(RANGE_END), SECOND);
        assert_eq!(table.find_route(RANGE_END + 1), FIRST);
        assert_eq!(table.find_kind(SECOND_TYPE), Required);
    }

    #[test]
    fn test_accept_client_with_matching_requirements() {
        let mut client = RoutingTable::new(FIRST, Required);
        client
            .add_route(FIRST_TYPE, FIRST, Optional)
            .add_route(SECOND_TYPE, SECOND, Required)
            .add_route(THIRD_TYPE, SECOND, Required)
            .add_route_range(RANGE_BEGIN, RANGE_END, FIRST, Optional);

        let merged = server_table().accept(&client).unwrap();
        assert_eq!(routes(&merged), [FIRST, FIRST, SECOND, SECOND, SECOND]);
    }

    #[test]
    fn test_accept_optional_client_routes_win() {
        let mut client = RoutingTable::new(SECOND, Optional);
        client
            .add_route(FIRST_TYPE, THIRD, Required)
            .add_route(SECOND_TYPE, SECOND, Optional)
            .add_route(THIRD_TYPE, THIRD, Optional)
            .add_route_range(RANGE_BEGIN, RANGE_END, SECOND, Optional);

        let merged = server_table().accept(&client).unwrap();
        assert_eq!(routes(&merged), [SECOND, THIRD, SECOND, THIRD, SECOND]);
    }

    #[test]
    fn test_accept_all_required_client() {
        let mut client = RoutingTable::new(THIRD, Required);
        client
            .add_route(FIRST_TYPE, THIRD, Required)
            .add_route(SECOND_TYPE, SECOND, Required)
            .add_route(THIRD_TYPE, FIRST, Required)
            .add_route_range(RANGE_BEGIN, RANGE_END, SECOND, Required);

        let merged = server_table().accept(&client).unwrap();
        assert_eq!(routes(&merged), [THIRD, THIRD, SECOND, FIRST, SECOND]);
    }

    #[test]
    fn test_reject_conflicting_required_default() {
        let client = RoutingTable::new(FIRST, Required);
        assert!(server_table().accept(&client).is_none());
    }

    #[test]
    fn test_accept_optional_default_only() {
        let client = RoutingTable::new(FIRST, Optional);
        let merged = server_table().accept(&client).unwrap();
        assert_eq!(routes(&merged), [FIRST, FIRST, SECOND, THIRD, SECOND]);

        let client = RoutingTable::new(SECOND, Optional);
        let merged = server_table().accept(&client).unwrap();
        assert_eq!(routes(&merged), [SECOND; 5]);
    }

    #[test]
    fn test_accept_splits_overlapping_ranges() {
        let mut server = RoutingTable::new(FIRST, Optional);
        server.add_route_range(10, 20, SECOND, Required);
        let mut client = RoutingTable::new(FIRST, Optional);
        client.add_route_range(15, 30, THIRD, Optional);

        let merged = server.accept(&client).unwrap();
        assert_eq!(merged.find_route(9), FIRST);
        assert_eq!(merged.find_route(12), SECOND);
        assert_eq!(merged.find_route(17), SECOND);
        assert_eq!(merged.find_route(25), THIRD);
        assert_eq!(merged.find_route(31), FIRST);
    }

    #[test]
    fn test_range_at_type_space_end() {
        let mut server = RoutingTable::new(FIRST, Optional);
        server.add_route_range(u32::MAX - 1, u32::MAX, SECOND, Optional);
        let merged = server.accept(&RoutingTable::new(FIRST, Optional)).unwrap();
        assert_eq!(merged.find_route(u32::MAX), FIRST);
        assert_eq!(merged.find_route(u32::MAX - 2), FIRST);
    }

    #[test]
    fn test_table_serde_roundtrip() {
        let table = server_table();
        let json = serde_json::to_string(&table).unwrap();
        let back: RoutingTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }
}
