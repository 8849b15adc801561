use approx::assert_abs_diff_eq;
use ndarray::Array3;
use stem_weaver::{SourceBuffer, StemError};

fn filled(sources: usize, frames: usize, value: f32) -> SourceBuffer {
    SourceBuffer::new(Array3::from_elem((sources, 2, frames), value))
}

#[test]
fn short_parts_are_padded_before_joining() {
    let merged =
        SourceBuffer::equalize_then_concat(vec![filled(4, 5, 1.0), filled(4, 3, 2.0)]).unwrap();

    assert_eq!(merged.layout(), (4, 2));
    assert_eq!(merged.frames(), 10);
    let lane: Vec<f32> = merged.view().slice(ndarray::s![0, 0, ..]).to_vec();
    assert_eq!(lane, vec![1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 0.0, 0.0]);

    let trimmed = merged.with_frames(8);
    assert_eq!(trimmed.frames(), 8);
}

#[test]
fn mismatched_layouts_are_rejected_with_the_chunk_index() {
    let err = SourceBuffer::equalize_then_concat(vec![
        filled(4, 5, 1.0),
        filled(4, 5, 1.0),
        filled(6, 5, 1.0),
    ])
    .unwrap_err();
    assert!(matches!(
        err,
        StemError::ChunkShape {
            index: 2,
            expected: (4, 2),
            got: (6, 2)
        }
    ));
}

#[test]
fn empty_part_list_is_an_error() {
    assert!(SourceBuffer::equalize_then_concat(Vec::new()).is_err());
    assert!(SourceBuffer::mean(Vec::new()).is_err());
}

#[test]
fn mean_averages_element_wise() {
    let avg = SourceBuffer::mean(vec![filled(4, 6, 1.0), filled(4, 6, 3.0)]).unwrap();
    for x in avg.view().iter() {
        assert_abs_diff_eq!(*x, 2.0, epsilon = 1e-6);
    }
}

#[test]
fn sum_excluding_skips_one_source() {
    let mut data = Array3::<f32>::zeros((4, 2, 3));
    for s in 0..4 {
        data.slice_mut(ndarray::s![s, .., ..]).fill(s as f32 + 1.0);
    }
    let buf = SourceBuffer::new(data);
    let acc = buf.sum_excluding(3, 44_100).unwrap();
    assert_abs_diff_eq!(acc.peak(), 1.0 + 2.0 + 3.0, epsilon = 1e-6);
    assert!(buf.sum_excluding(7, 44_100).is_none());
    assert!(buf.source(4, 44_100).is_none());
}
