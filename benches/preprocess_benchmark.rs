use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use leafscope::{
    ClassIndexTable, EngineError, ForwardPass, ImagePreprocessor, InferenceEngine, Normalization,
    TensorLayout,
};
use ndarray::Array4;

struct UniformModel {
    classes: usize,
}

impl ForwardPass for UniformModel {
    fn forward(&self, _input: Array4<f32>) -> Result<Vec<f32>, EngineError> {
        Ok((0..self.classes).map(|i| i as f32).collect())
    }
}

fn encoded_leaf(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, ((x + y) % 256) as u8, (y % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn bench_preprocessing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Preprocessing");
    group.sample_size(50);
    group.warm_up_time(std::time::Duration::from_secs(1));

    let small = encoded_leaf(128, 128, image::ImageFormat::Png);
    let photo = encoded_leaf(1024, 768, image::ImageFormat::Jpeg);

    let passthrough = ImagePreprocessor::default();
    let imagenet = ImagePreprocessor::new(Normalization::Imagenet, TensorLayout::Nchw);

    group.bench_function("png_128_passthrough", |b| {
        b.iter(|| passthrough.prepare(black_box(&small)).unwrap())
    });
    group.bench_function("jpeg_1024_passthrough", |b| {
        b.iter(|| passthrough.prepare(black_box(&photo)).unwrap())
    });
    group.bench_function("jpeg_1024_imagenet_nchw", |b| {
        b.iter(|| imagenet.prepare(black_box(&photo)).unwrap())
    });

    group.finish();
}

fn bench_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("Ranking");
    group.sample_size(50);
    group.warm_up_time(std::time::Duration::from_secs(1));

    // 38 classes, as in the PlantVillage label set
    let classes = ClassIndexTable::from_mapping((0..38).map(|i| (format!("class_{}", i), i as i64)))
        .unwrap();
    let engine = InferenceEngine::new(
        Box::new(UniformModel { classes: 38 }),
        classes,
        ImagePreprocessor::default(),
    );
    let image = encoded_leaf(256, 256, image::ImageFormat::Png);

    for k in [1, 5, 38] {
        group.bench_function(format!("predict_top_{}", k), |b| {
            b.iter(|| engine.predict_top_k(black_box(&image), k).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_preprocessing, bench_ranking);
criterion_main!(benches);
