use proptest::prelude::*;
use xlsx_template::address::{CellRef, RangeRef, Span};
use xlsx_template::blueprint::{CollectionSizes, Direction, RepeatRegionSpec};
use xlsx_template::formula::{adjust_for_repeat_index, adjust_for_row_expansion};
use xlsx_template::position::{PositionMap, RowInfo};

fn region(collection: &str, range: &str) -> RepeatRegionSpec {
    RepeatRegionSpec {
        collection: collection.into(),
        variable: collection.into(),
        range: RangeRef::parse(range).unwrap(),
        direction: Direction::Down,
        empty_range: None,
        marker: CellRef::new(0, 0),
    }
}

proptest! {
    #[test]
    fn side_by_side_band_takes_the_taller_region(
        start in 0u32..10,
        height in 1u32..4,
        left in 0usize..15,
        right in 0usize..15,
        trailing in 0u32..5,
    ) {
        let end = start + height - 1;
        let template_rows = end + 1 + trailing;
        let regions = [
            region("left", &format!("A{}:B{}", start + 1, end + 1)),
            region("right", &format!("D{}:E{}", start + 1, end + 1)),
        ];
        let sizes: CollectionSizes = [("left".to_string(), left), ("right".to_string(), right)]
            .into_iter()
            .collect();
        let map = PositionMap::calculate(&regions, &sizes, template_rows).unwrap();

        let items = left.max(right);
        prop_assert_eq!(map.bands().len(), 1);
        prop_assert_eq!(
            map.total_rows() as usize,
            (template_rows - height) as usize + items * height as usize
        );
        let band = &map.bands()[0];
        prop_assert_eq!(band.region_at_col(0).map(|r| r.items), Some(left));
        prop_assert_eq!(band.region_at_col(4).map(|r| r.items), Some(right));

        // rows below the band keep their order
        for t in (end + 1)..template_rows {
            let row = map.final_row(t).unwrap();
            prop_assert_eq!(map.row_info(row), Some(RowInfo::Static(t)));
        }
    }

    #[test]
    fn references_below_a_grown_block_shift_by_the_growth(
        block in 1u32..20,
        below in 1u32..40,
        growth in 0i64..50,
    ) {
        let target = block + below + 1;
        let formula = format!("B{target}*2");
        let adjusted = adjust_for_row_expansion(&formula, Span::new(block - 1, block - 1), growth)
            .unwrap();
        prop_assert_eq!(adjusted, format!("B{}*2", target as i64 + growth));
    }

    #[test]
    fn absolute_references_survive_repetition(
        row in 1u32..30,
        index in 0usize..25,
    ) {
        let formula = format!("$A${row}+A{row}");
        let adjusted = adjust_for_repeat_index(&formula, index, Span::new(row - 1, row - 1))
            .unwrap();
        prop_assert_eq!(adjusted, format!("$A${row}+A{}", row as usize + index));
    }
}
