// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use pipeweb::path::{sort, CompiledPath};

const TEMPLATES: [&str; 12] = [
    "/",
    "/users",
    "/users/{id}",
    "/users/{id}/posts",
    "/users/{id}/posts/{post}",
    "/files/{path*}",
    "/images/{name}.png",
    "/images/{name}.jpeg",
    "/pair/{both*2}",
    "/archive/{year}/{month?}",
    "/static/{file*}",
    "/{catch*}",
];

fn compile_benchmark(c: &mut Criterion) {
    c.bench_function("path_compile", |b| {
        b.iter(|| {
            for template in TEMPLATES.iter() {
                let _ = CompiledPath::compile(black_box(template), true).unwrap();
            }
        });
    });
}

fn match_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_match");
    let cases = [
        ("literal", "/users", "/users"),
        ("param", "/users/{id}/posts/{post}", "/users/42/posts/7"),
        ("mixed", "/images/{name}.jpeg", "/images/cat.jpeg"),
        ("wildcard", "/files/{path*}", "/files/a/b/c/d/e.txt"),
        ("encoded", "/users/{id}", "/users/%E4%BD%A0%E5%A5%BD"),
    ];

    for (name, template, path) in cases.iter() {
        let compiled = CompiledPath::compile(template, true).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), path, |b, path| {
            b.iter(|| {
                let matched = compiled.match_path(black_box(path)).unwrap();
                assert!(matched.is_some());
            });
        });
    }

    group.finish();
}

/// 按路由数量测量排序开销
fn sort_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_sort");

    for count in [10, 100, 1000].iter() {
        let paths: Vec<CompiledPath> = (0..*count)
            .map(|i| {
                let template = match i % 4 {
                    0 => format!("/r{}/literal", i),
                    1 => format!("/r{}/{{id}}", i),
                    2 => format!("/r{}/x{{id}}.json", i),
                    _ => format!("/r{}/{{rest*}}", i),
                };
                CompiledPath::compile(&template, true).unwrap()
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &paths, |b, paths| {
            b.iter(|| {
                let mut sorted: Vec<&CompiledPath> = paths.iter().collect();
                sorted.sort_by(|a, b| sort(a, b));
                black_box(sorted);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, compile_benchmark, match_benchmark, sort_benchmark);
criterion_main!(benches);
