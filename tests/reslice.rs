//! End-to-end reslice scenarios across both execution paths

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use reslice3d::reslice::{ExecutePath, ProgressObserver};
use reslice3d::{
    AnyImage, BSplineCoefficients, BorderMode, Extent, GridTransform, ImageData, ImageStencil,
    InterpolationMode, Interpolator, Kernel, LinearTransform, Matrix4, Reslice, ResliceConfig, ScalarType, SlabMode,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ramp<T: reslice3d::Scalar>(dims: [usize; 3]) -> ImageData<T> {
    ImageData::from_fn(Extent::from_dims(dims), 1, |x, y, z, _| {
        T::from_double_round((x + 3 * y + 7 * z) as f64)
    })
}

fn wavy(dims: [usize; 3]) -> ImageData<f32> {
    ImageData::from_fn(Extent::from_dims(dims), 1, |x, y, z, _| {
        (x as f32 * 0.7).sin() * 40.0 + (y * y) as f32 + 3.0 * z as f32
    })
}

fn run(config: ResliceConfig, axes: Matrix4, input: &AnyImage) -> reslice3d::ResliceOutput {
    init_logging();
    let mut reslice = Reslice::new(config);
    reslice.set_reslice_axes(axes);
    reslice.execute(input).unwrap()
}

#[test]
fn test_nearest_identity_is_exact() {
    let inputs: [AnyImage; 3] = [
        ramp::<u8>([7, 5, 3]).into(),
        ramp::<i16>([4, 6, 5]).into(),
        ramp::<f32>([5, 5, 5]).into(),
    ];
    for input in &inputs {
        for (optimization, path) in [(true, ExecutePath::Permute), (false, ExecutePath::Generic)] {
            let config = ResliceConfig {
                optimization,
                ..ResliceConfig::default()
            };
            let out = run(config, Matrix4::identity(), input);
            assert_eq!(out.path, path);
            assert_eq!(out.image.scalar_type(), input.scalar_type());
            assert_eq!(out.image.geometry(), input.geometry());
            assert_eq!(out.image.to_f64().as_slice(), input.to_f64().as_slice());
        }
    }
}

#[test]
fn test_permute_matches_generic() {
    let input: AnyImage = wavy([12, 10, 8]).into();
    // swap x and y, with a fractional offset and a finer output grid
    let axes = Matrix4::from_axes([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.3, -0.6, 0.25]);
    for mode in [InterpolationMode::Linear, InterpolationMode::Cubic] {
        let config = ResliceConfig {
            interpolation_mode: mode,
            output_spacing: Some([0.7, 1.0, 1.3]),
            output_origin: Some([0.0; 3]),
            // reaches past the input on the first and last axis
            output_extent: Some(Extent::new(-2, 15, 0, 11, 0, 6)),
            output_scalar_type: Some(ScalarType::F64),
            background_color: [-5.0, 0.0, 0.0, 0.0],
            ..ResliceConfig::default()
        };
        let fast = run(config.clone(), axes, &input);
        let slow = run(
            ResliceConfig {
                optimization: false,
                ..config
            },
            axes,
            &input,
        );
        assert_eq!(fast.path, ExecutePath::Permute);
        assert_eq!(slow.path, ExecutePath::Generic);
        assert_eq!(fast.image.extent(), slow.image.extent());
        let (a, b) = (fast.image.to_f64(), slow.image.to_f64());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-9);
        }
        assert!(a.as_slice().iter().any(|&v| v == -5.0));
    }
}

#[test]
fn test_slab_compositing() {
    // every slice holds its own z index
    let input: AnyImage =
        ImageData::<f64>::from_fn(Extent::from_dims([4, 4, 6]), 1, |_, _, z, _| z as f64).into();
    let cases = [
        (SlabMode::Mean, false, 2.0, 0.5),
        (SlabMode::Sum, false, 6.0, 1.0),
        (SlabMode::Min, false, 1.0, 0.0),
        (SlabMode::Max, false, 3.0, 1.0),
        (SlabMode::Mean, true, 2.0, 0.5),
        (SlabMode::Sum, true, 4.0, 0.5),
    ];
    for (mode, trapezoid, middle, edge) in cases {
        for optimization in [true, false] {
            let config = ResliceConfig {
                slab_number_of_slices: 3,
                slab_mode: mode,
                slab_trapezoid_integration: trapezoid,
                optimization,
                ..ResliceConfig::default()
            };
            let out = run(config, Matrix4::identity(), &input);
            // slice 2 sees 1, 2, 3; slice 0 loses the sample below the input
            assert_relative_eq!(out.image.get([1, 2, 2], 0).unwrap(), middle, epsilon = 1e-12);
            assert_relative_eq!(out.image.get([3, 0, 0], 0).unwrap(), edge, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_stencils_in_and_out() {
    let input: AnyImage =
        ImageData::<u8>::from_fn(Extent::from_dims([6, 6, 1]), 1, |_, _, _, _| 9).into();
    let extent = Extent::from_dims([6, 6, 1]);
    for optimization in [true, false] {
        let mut reslice = Reslice::new(ResliceConfig {
            optimization,
            generate_stencil_output: true,
            output_extent: Some(extent),
            output_origin: Some([0.0; 3]),
            output_spacing: Some([1.0; 3]),
            ..ResliceConfig::default()
        });
        // output x reads input x + 2
        reslice.set_reslice_axes_origin([2.0, 0.0, 0.0]);
        reslice.set_stencil(Some(ImageStencil::from_fn(extent, |x, y, _| x >= 2 && y != 4)));
        let out = reslice.execute(&input).unwrap();

        let stencil = out.stencil.unwrap();
        for y in 0..6 {
            let expected: &[(i32, i32)] = if y == 4 { &[] } else { &[(2, 3)] };
            assert_eq!(stencil.extents(y, 0), expected);
            for x in 0..6 {
                let v = if y != 4 && (2..=3).contains(&x) { 9.0 } else { 0.0 };
                assert_eq!(out.image.get([x, y, 0], 0), Some(v));
            }
        }
    }
}

#[test]
fn test_conversion_rescales_and_clamps() {
    let input: AnyImage =
        ImageData::from_vec(Extent::from_dims([3, 1, 1]), 1, vec![-10.0f32, 100.0, 300.0])
            .unwrap()
            .into();
    let out = run(
        ResliceConfig {
            output_scalar_type: Some(ScalarType::U8),
            ..ResliceConfig::default()
        },
        Matrix4::identity(),
        &input,
    );
    assert_eq!(out.image.scalar_type(), ScalarType::U8);
    assert_eq!(out.image.to_f64().as_slice(), &[0.0, 100.0, 255.0]);

    let out = run(
        ResliceConfig {
            output_scalar_type: Some(ScalarType::I16),
            scalar_shift: 10.0,
            scalar_scale: 0.5,
            ..ResliceConfig::default()
        },
        Matrix4::identity(),
        &input,
    );
    assert_eq!(out.image.to_f64().as_slice(), &[0.0, 55.0, 155.0]);
}

#[test]
fn test_far_output_is_cleared() {
    let input: AnyImage =
        ImageData::<u8>::from_fn(Extent::from_dims([4, 4, 4]), 3, |x, _, _, c| (x as usize + c) as u8).into();
    let mut reslice = Reslice::new(ResliceConfig {
        background_color: [1.0, 2.0, 3.0, 4.0],
        generate_stencil_output: true,
        ..ResliceConfig::default()
    });
    let shift = LinearTransform::new(Matrix4::translation(0.0, 50.0, 0.0)).unwrap();
    reslice.set_reslice_transform(Some(Arc::new(shift)));
    let out = reslice.execute(&input).unwrap();
    assert_eq!(out.path, ExecutePath::Clear);
    assert!(!out.hit_input_extent);
    assert_eq!(out.image.components(), 3);
    for c in 0..3 {
        assert_eq!(out.image.get([2, 1, 3], c), Some((c + 1) as f64));
    }
    assert_eq!(out.stencil.unwrap().count_inside(), 0);
}

#[test]
fn test_json_config_drives_the_engine() {
    let config = ResliceConfig::from_json(
        r#"{
            "interpolation_mode": "linear",
            "output_scalar_type": "f64",
            "output_extent": [0, 3, 0, 0, 0, 0],
            "output_spacing": [0.5, 1.0, 1.0],
            "output_origin": [0.0, 1.0, 0.0]
        }"#,
    )
    .unwrap();
    let out = run(config, Matrix4::identity(), &ramp::<f32>([6, 4, 2]).into());
    assert_eq!(out.image.scalar_type(), ScalarType::F64);
    assert_eq!(out.image.to_f64().as_slice(), &[3.0, 3.5, 4.0, 4.5]);
}

#[test]
fn test_displacement_grid_shifts_samples() {
    let input: AnyImage = ramp::<f32>([6, 5, 4]).into();
    let field = ImageData::<f32>::from_fn(Extent::from_dims([6, 5, 4]), 3, |_, _, _, c| {
        if c == 0 {
            1.0
        } else {
            0.0
        }
    });
    let mut reslice = Reslice::new(ResliceConfig {
        background_color: [-1.0, 0.0, 0.0, 0.0],
        ..ResliceConfig::default()
    });
    reslice.set_reslice_transform(Some(Arc::new(GridTransform::with_grid(AnyImage::from(field)).unwrap())));
    let out = reslice.execute(&input).unwrap();
    assert_eq!(out.path, ExecutePath::Generic);
    for x in 0..6 {
        let expected = if x < 5 { (x + 1 + 3 * 2 + 7) as f64 } else { -1.0 };
        assert_eq!(out.image.get([x, 2, 1], 0), Some(expected));
    }
}

#[test]
fn test_bspline_kernel_reproduces_samples() {
    let samples = wavy([9, 7, 5]);
    let coefficients = BSplineCoefficients::new(3, BorderMode::Mirror, ScalarType::F64)
        .unwrap()
        .compute(&samples.clone().into())
        .unwrap();
    let mut reslice = Reslice::new(ResliceConfig {
        border_mode: BorderMode::Mirror,
        ..ResliceConfig::default()
    });
    reslice.set_interpolator(Interpolator::with_kernel(Kernel::bspline(3)));
    let out = reslice.execute(&coefficients).unwrap();
    assert_eq!(out.path, ExecutePath::Permute);
    assert_eq!(out.image.scalar_type(), ScalarType::F64);
    let expected = AnyImage::from(samples).to_f64();
    for (a, b) in out.image.to_f64().as_slice().iter().zip(expected.as_slice()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-4);
    }
}

#[test]
fn test_two_dimensional_output_extracts_a_slice() {
    let input = ramp::<i16>([5, 4, 6]);
    let mut reslice = Reslice::new(ResliceConfig {
        output_dimensionality: 2,
        ..ResliceConfig::default()
    });
    reslice.set_reslice_axes_origin([0.0, 0.0, 2.0]);
    let out = reslice.execute(&input.clone().into()).unwrap();
    assert_eq!(out.image.extent(), Extent::new(0, 4, 0, 3, 0, 0));
    for y in 0..4 {
        for x in 0..5 {
            assert_eq!(out.image.get([x, y, 0], 0), input.get([x, y, 2], 0).map(|v| v as f64));
        }
    }
}

#[derive(Default)]
struct CountRows {
    calls: AtomicUsize,
    last_total: AtomicUsize,
}

impl ProgressObserver for CountRows {
    fn update(&self, _rows_done: usize, rows_total: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.last_total.store(rows_total, Ordering::Relaxed);
    }
}

#[test]
fn test_progress_reports_every_row() {
    let observer = Arc::new(CountRows::default());
    let mut reslice = Reslice::new(ResliceConfig {
        interpolation_mode: InterpolationMode::Linear,
        ..ResliceConfig::default()
    });
    reslice.set_reslice_axes(Matrix4::rotate_x(0.4));
    reslice.set_progress_observer(Some(observer.clone()));
    let out = reslice.execute(&ramp::<u16>([8, 6, 5]).into()).unwrap();
    let [_, ny, nz] = out.image.extent().dims();
    assert_eq!(observer.calls.load(Ordering::Relaxed), ny * nz);
    assert_eq!(observer.last_total.load(Ordering::Relaxed), ny * nz);
}
