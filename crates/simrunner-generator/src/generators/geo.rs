//! Geospatial operators.
//!
//! `%longlat` draws from a small built-in gazetteer of city coordinates,
//! keyed by country name. Coordinates are `[longitude, latitude]` pairs.

use crate::compiler::DocumentGenerator;
use crate::context::GenContext;
use crate::generators::{doc_f64, to_f64};
use bson::Bson;
use rand::Rng;
use tracing::warn;

const PLACES: &[(&str, &[(f64, f64)])] = &[
    (
        "France",
        &[
            (2.3522, 48.8566),   // Paris
            (5.3698, 43.2965),   // Marseille
            (4.8357, 45.7640),   // Lyon
            (-0.5792, 44.8378),  // Bordeaux
            (7.2620, 43.7102),   // Nice
        ],
    ),
    (
        "United States",
        &[
            (-74.0060, 40.7128),  // New York
            (-118.2437, 34.0522), // Los Angeles
            (-87.6298, 41.8781),  // Chicago
            (-95.3698, 29.7604),  // Houston
            (-122.4194, 37.7749), // San Francisco
        ],
    ),
    (
        "United Kingdom",
        &[
            (-0.1276, 51.5072), // London
            (-2.2426, 53.4808), // Manchester
            (-3.1883, 55.9533), // Edinburgh
            (-1.8904, 52.4862), // Birmingham
        ],
    ),
    (
        "Germany",
        &[
            (13.4050, 52.5200), // Berlin
            (11.5820, 48.1351), // Munich
            (9.9937, 53.5511),  // Hamburg
            (6.9603, 50.9375),  // Cologne
        ],
    ),
    (
        "Japan",
        &[
            (139.6917, 35.6895), // Tokyo
            (135.5023, 34.6937), // Osaka
            (141.3545, 43.0618), // Sapporo
        ],
    ),
    (
        "Australia",
        &[
            (151.2093, -33.8688), // Sydney
            (144.9631, -37.8136), // Melbourne
            (153.0251, -27.4698), // Brisbane
        ],
    ),
    (
        "Brazil",
        &[
            (-46.6333, -23.5505), // Sao Paulo
            (-43.1729, -22.9068), // Rio de Janeiro
            (-47.8825, -15.7942), // Brasilia
        ],
    ),
    (
        "India",
        &[
            (72.8777, 19.0760), // Mumbai
            (77.1025, 28.7041), // Delhi
            (77.5946, 12.9716), // Bangalore
        ],
    ),
];

fn places_for(country: &str) -> Option<&'static [(f64, f64)]> {
    PLACES
        .iter()
        .find(|(name, _)| *name == country)
        .map(|(_, places)| *places)
}

/// `%longlat`: a random city coordinate, optionally restricted to
/// `countries` and displaced by up to `jitter` arc minutes in a random
/// direction.
pub fn long_lat(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);

    let countries: Vec<String> = match p.get_array("countries") {
        Ok(values) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Err(_) => PLACES.iter().map(|(name, _)| name.to_string()).collect(),
    };
    if countries.is_empty() {
        return Bson::Array(vec![Bson::Double(0.0), Bson::Double(0.0)]);
    }

    let country = &countries[ctx.rng.random_range(0..countries.len())];
    let Some(places) = places_for(country) else {
        warn!("unknown country {country}");
        return Bson::Array(vec![Bson::Double(0.0), Bson::Double(0.0)]);
    };

    let (mut long, mut lat) = places[ctx.rng.random_range(0..places.len())];

    if let Some(jitter) = doc_f64(&p, "jitter") {
        // jitter is expressed in arc minutes
        let radius = jitter / 60.0;
        let alpha: f64 = ctx.rng.random_range(0.0..2.0 * std::f64::consts::PI);
        long += radius * alpha.sin();
        lat += radius * alpha.cos();
    }

    Bson::Array(vec![Bson::Double(long), Bson::Double(lat)])
}

/// `%coordLine`: a uniformly random point on the segment `from` - `to`.
pub fn coord_line(params: &DocumentGenerator, ctx: &mut GenContext) -> Bson {
    let p = params.generate_document(ctx);
    let (Some(from), Some(to)) = (read_pair(p.get("from")), read_pair(p.get("to"))) else {
        warn!("%coordLine needs 'from' and 'to' coordinate pairs");
        return Bson::Null;
    };
    let alpha: f64 = ctx.rng.random_range(0.0..1.0);
    let x = from.0 + (to.0 - from.0) * alpha;
    let y = from.1 + (to.1 - from.1) * alpha;
    Bson::Array(vec![Bson::Double(x), Bson::Double(y)])
}

fn read_pair(value: Option<&Bson>) -> Option<(f64, f64)> {
    let Some(Bson::Array(items)) = value else {
        return None;
    };
    match items.as_slice() {
        [x, y] => Some((to_f64(x)?, to_f64(y)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::context::TemplateState;
    use bson::bson;
    use std::sync::Arc;

    fn ctx() -> GenContext {
        GenContext::new(Arc::new(TemplateState::default()), "test", 0)
    }

    fn generate(spec: Bson, ctx: &mut GenContext) -> Bson {
        Compiler::default().compile(&spec).unwrap().generate(ctx)
    }

    fn as_pair(value: Bson) -> (f64, f64) {
        let Bson::Array(items) = value else {
            panic!("expected an array");
        };
        let (Some(Bson::Double(x)), Some(Bson::Double(y))) = (items.first(), items.get(1)) else {
            panic!("expected a pair of doubles");
        };
        (*x, *y)
    }

    #[test]
    fn test_longlat_restricted_to_country() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%longlat": { "countries": ["France"] } }))
            .unwrap();
        for _ in 0..50 {
            let (long, lat) = as_pair(gen.generate(&mut ctx));
            assert!(places_for("France")
                .unwrap()
                .iter()
                .any(|(pl, pa)| *pl == long && *pa == lat));
        }
    }

    #[test]
    fn test_longlat_jitter_stays_close() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%longlat": { "countries": ["Japan"], "jitter": 6.0 } }))
            .unwrap();
        let radius = 6.0 / 60.0;
        for _ in 0..50 {
            let (long, lat) = as_pair(gen.generate(&mut ctx));
            let close = places_for("Japan").unwrap().iter().any(|(pl, pa)| {
                ((pl - long).powi(2) + (pa - lat).powi(2)).sqrt() <= radius + 1e-9
            });
            assert!(close);
        }
    }

    #[test]
    fn test_longlat_unknown_country_is_origin() {
        let mut ctx = ctx();
        let value = generate(
            bson!({ "%longlat": { "countries": ["Atlantis"] } }),
            &mut ctx,
        );
        assert_eq!(as_pair(value), (0.0, 0.0));
    }

    #[test]
    fn test_coord_line_interpolates() {
        let mut ctx = ctx();
        let gen = Compiler::default()
            .compile(&bson!({ "%coordLine": { "from": [0.0, 0.0], "to": [10.0, 20.0] } }))
            .unwrap();
        for _ in 0..50 {
            let (x, y) = as_pair(gen.generate(&mut ctx));
            assert!((0.0..10.0).contains(&x));
            assert!((y - 2.0 * x).abs() < 1e-9);
        }
    }
}
