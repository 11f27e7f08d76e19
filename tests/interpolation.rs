//! Interpolation through the public API, for every storage type

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reslice3d::{
    AnyImage, BSplineCoefficients, BorderMode, Extent, ImageData, Interpolator, Kernel, Matrix4, Scalar,
    ScalarType,
};

fn grid3x3<T: Scalar>() -> ImageData<T> {
    ImageData::from_fn(Extent::from_dims([3, 3, 1]), 1, |x, y, _, _| {
        T::from_double_round((1 + x + 3 * y) as f64)
    })
}

fn check_grid3x3<T: Scalar>() {
    let img = grid3x3::<T>();
    for kernel in [Kernel::Nearest, Kernel::Linear] {
        let mut interp = Interpolator::with_kernel(kernel);
        let bound = interp.bind(&img);
        let mut out = [0.0f64];
        assert!(bound.interpolate([1.0, 1.0, 0.0], &mut out));
        assert_eq!(out[0], 5.0);
    }
    let mut interp = Interpolator::with_kernel(Kernel::Linear);
    let bound = interp.bind(&img);
    let mut out = [0.0f32];
    bound.interpolate_ijk([0.5f32, 0.5, 0.0], &mut out);
    assert_relative_eq!(out[0], 3.0);
}

#[test]
fn test_three_by_three_grid_every_type() {
    check_grid3x3::<i8>();
    check_grid3x3::<u8>();
    check_grid3x3::<i16>();
    check_grid3x3::<u16>();
    check_grid3x3::<i32>();
    check_grid3x3::<u32>();
    check_grid3x3::<reslice3d::f16>();
    check_grid3x3::<f32>();
    check_grid3x3::<f64>();
}

#[test]
fn test_border_modes_agree_across_kernels() {
    let img = ImageData::<f64>::from_fn(Extent::from_dims([4, 4, 4]), 1, |x, y, z, _| {
        (x + 4 * y + 16 * z) as f64
    });
    // one voxel past the high x edge
    for (mode, x) in [(BorderMode::Clamp, 3.0), (BorderMode::Repeat, 0.0), (BorderMode::Mirror, 2.0)] {
        for kernel in [Kernel::Nearest, Kernel::Linear, Kernel::Cubic] {
            let mut interp = Interpolator::with_kernel(kernel);
            interp.set_border_mode(mode);
            let bound = interp.bind(&img);
            let mut out = [0.0f64];
            bound.interpolate_ijk([4.0, 2.0, 1.0], &mut out);
            assert_relative_eq!(out[0], x + 8.0 + 16.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_weights_partition_unity() {
    let ones = ImageData::<u16>::from_fn(Extent::new(-3, 4, 2, 6, 0, 5), 2, |_, _, _, _| 1);
    let mut rng = StdRng::seed_from_u64(11);
    for kernel in [Kernel::Linear, Kernel::Cubic, Kernel::bspline(0), Kernel::bspline(4), Kernel::bspline(9)] {
        for border in [BorderMode::Clamp, BorderMode::Repeat, BorderMode::Mirror] {
            let mut interp = Interpolator::with_kernel(kernel);
            interp.set_border_mode(border);
            let bound = interp.bind(&ones);
            for _ in 0..50 {
                let p = [
                    rng.gen_range(-4.0..5.0),
                    rng.gen_range(1.0..7.0),
                    rng.gen_range(-1.0..6.0),
                ];
                let mut out = [0.0f64; 2];
                bound.interpolate_ijk(p, &mut out);
                assert_relative_eq!(out[0], 1.0, epsilon = 1e-9);
                assert_relative_eq!(out[1], 1.0, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_bspline_interpolator_matches_coefficient_evaluation() {
    let samples = ImageData::<f32>::from_fn(Extent::from_dims([8, 7, 6]), 1, |x, y, z, _| {
        ((x * 5 + y * 3 + z * 7) % 11) as f32
    });
    let mut rng = StdRng::seed_from_u64(5);
    for degree in [2, 3, 5] {
        let spline = BSplineCoefficients::new(degree, BorderMode::Mirror, ScalarType::F64).unwrap();
        let coefficients = spline.compute(&samples.clone().into()).unwrap();
        let AnyImage::F64(c) = &coefficients else {
            panic!("coefficients must be f64");
        };
        let mut interp = Interpolator::with_kernel(Kernel::bspline(degree));
        interp.set_border_mode(BorderMode::Mirror);
        let bound = interp.bind(c);

        // the spline passes through the samples
        for index in [[0, 0, 0], [3, 4, 2], [7, 6, 5]] {
            let mut out = [0.0f64];
            bound.interpolate_ijk(index.map(|v| v as f64), &mut out);
            let expected = samples.get(index, 0).map(f64::from).unwrap();
            assert_relative_eq!(out[0], expected, epsilon = 1e-6);
        }
        for _ in 0..20 {
            let p = [rng.gen_range(0.0..7.0), rng.gen_range(0.0..6.0), rng.gen_range(0.0..5.0)];
            let (mut a, mut b) = ([0.0f64], [0.0f64]);
            bound.interpolate_ijk(p, &mut a);
            spline.evaluate(&coefficients, p, &mut b);
            assert_relative_eq!(a[0], b[0], epsilon = 1e-9);
        }
    }
}

#[test]
fn test_precomputed_rows_match_points() {
    let img = ImageData::<i16>::from_fn(Extent::from_dims([9, 8, 7]), 1, |x, y, z, _| {
        (x * x - 3 * y + 5 * z) as i16
    });
    // output x reads input z, output y reads input x
    let matrix = Matrix4::new([
        [0.0, 1.25, 0.0, -0.5],
        [0.0, 0.0, 0.5, 1.75],
        [0.8, 0.0, 0.0, 0.3],
        [0.0, 0.0, 0.0, 1.0],
    ]);
    let out_ext = Extent::new(-2, 9, 0, 6, 0, 11);
    for kernel in [Kernel::Linear, Kernel::Cubic, Kernel::bspline(3)] {
        let mut interp = Interpolator::with_kernel(kernel);
        let bound = interp.bind(&img);
        let (weights, clip) = bound.precompute_weights::<f64>(&matrix, out_ext);
        assert!(!clip.is_empty());
        let width = clip.len(0);
        let mut row = vec![0.0f64; width];
        for z in clip.min(2)..=clip.max(2) {
            for y in clip.min(1)..=clip.max(1) {
                bound.interpolate_row(&weights, [clip.min(0), y, z], &mut row);
                for (i, v) in row.iter().enumerate() {
                    let x = clip.min(0) + i as i32;
                    let p = matrix.transform_point([x as f64, y as f64, z as f64]);
                    let mut expected = [0.0f64];
                    bound.interpolate_ijk(p, &mut expected);
                    assert_relative_eq!(*v, expected[0], epsilon = 1e-9);
                }
            }
        }
    }
}
