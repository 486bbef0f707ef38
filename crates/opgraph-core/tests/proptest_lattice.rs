//! Property tests for the dimension and partial-shape lattice.

use opgraph_core::{Dimension, PartialShape};
use proptest::prelude::*;

fn arb_dim() -> impl Strategy<Value = Dimension> {
    prop_oneof![
        1 => Just(Dimension::Dynamic),
        3 => (0usize..4).prop_map(Dimension::Static),
    ]
}

fn arb_shape() -> impl Strategy<Value = PartialShape> {
    prop_oneof![
        1 => Just(PartialShape::Dynamic),
        4 => prop::collection::vec(arb_dim(), 0..=3).prop_map(PartialShape::new),
    ]
}

/// A shape and a copy of it with some known dims hidden.
fn shape_and_relaxed() -> impl Strategy<Value = (PartialShape, PartialShape)> {
    prop::collection::vec(arb_dim(), 0..=4).prop_flat_map(|dims| {
        let len = dims.len();
        (Just(dims), prop::collection::vec(prop::bool::ANY, len)).prop_map(|(dims, hide)| {
            let relaxed = dims
                .iter()
                .zip(&hide)
                .map(|(&d, &h)| if h { Dimension::Dynamic } else { d })
                .collect::<Vec<_>>();
            (PartialShape::new(dims), PartialShape::new(relaxed))
        })
    })
}

proptest! {
    #[test]
    fn dim_merge_is_symmetric(a in arb_dim(), b in arb_dim()) {
        prop_assert_eq!(a.merge(b), b.merge(a));
        prop_assert_eq!(a.compatible(b), a.merge(b).is_some());
    }

    #[test]
    fn dim_merge_refines_both(a in arb_dim(), b in arb_dim()) {
        if let Some(m) = a.merge(b) {
            prop_assert!(m.refines(a));
            prop_assert!(m.refines(b));
        }
    }

    #[test]
    fn shape_merge_is_idempotent(s in arb_shape()) {
        prop_assert_eq!(s.merge(&s), Some(s.clone()));
        prop_assert!(s.refines(&s));
    }

    #[test]
    fn dynamic_is_merge_identity(s in arb_shape()) {
        prop_assert_eq!(s.merge(&PartialShape::Dynamic), Some(s.clone()));
        prop_assert_eq!(PartialShape::Dynamic.merge(&s), Some(s.clone()));
        prop_assert!(s.refines(&PartialShape::Dynamic));
    }

    #[test]
    fn shape_merge_is_symmetric(a in arb_shape(), b in arb_shape()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
        prop_assert_eq!(a.compatible(&b), a.merge(&b).is_some());
    }

    #[test]
    fn merged_shape_refines_operands(a in arb_shape(), b in arb_shape()) {
        if let Some(m) = a.merge(&b) {
            prop_assert!(m.refines(&a));
            prop_assert!(m.refines(&b));
        }
    }

    #[test]
    fn hiding_dims_relaxes((full, relaxed) in shape_and_relaxed()) {
        prop_assert!(full.refines(&relaxed));
        prop_assert!(full.compatible(&relaxed));
        prop_assert_eq!(full.merge(&relaxed), Some(full.clone()));
    }

    #[test]
    fn static_shapes_roundtrip(dims in prop::collection::vec(0usize..6, 0..=4)) {
        let shape = opgraph_core::Shape::new(dims);
        let partial = PartialShape::from(&shape);
        prop_assert!(partial.is_static());
        prop_assert_eq!(partial.to_shape(), Some(shape));
    }
}
