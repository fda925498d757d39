use survey_binning::lattice::{GrowPoints, RollOffsets};
use survey_binning::{Block, Coord, Role, Seed, SurveyGeometry, Template};

#[test]
fn test_receiver_grid_scenario() {
    let seed = Seed::new("rec", Role::Receiver, 0.0, 0.0)
        .with_grow(8, 0.0, 200.0)
        .with_grow(240, 50.0, 0.0);
    let template = Template::new("T").with_seed(seed);
    let geometry = SurveyGeometry::new("patch").with_block(Block::new("B").with_template(template));
    geometry.validate().unwrap();

    let template = &geometry.blocks[0].templates[0];
    let instances: Vec<_> = RollOffsets::new(&template.roll).collect();
    assert_eq!(instances.len(), 1);

    let points: Vec<Coord> = GrowPoints::new(&template.seeds[0], (instances[0].dx, instances[0].dy))
        .map(|p| p.position)
        .collect();
    assert_eq!(points.len(), 1920);
    assert_eq!(geometry.generated_point_count(Role::Receiver), 1920);
    for i in 0..8 {
        for j in 0..240 {
            assert_eq!(points[i * 240 + j], Coord::new(50.0 * j as f64, 200.0 * i as f64));
        }
    }
}

#[test]
fn test_single_count_step_does_not_shift() {
    let seed = Seed::new("src", Role::Source, 5975.0, 625.0)
        .with_grow(1, 250.0, 0.0)
        .with_grow(4, 0.0, 50.0);
    let points: Vec<Coord> = GrowPoints::new(&seed, (0.0, 0.0)).map(|p| p.position).collect();
    let expected: Vec<Coord> = (0..4)
        .map(|k| Coord::new(5975.0, 625.0 + 50.0 * k as f64))
        .collect();
    assert_eq!(points, expected);
}

#[test]
fn test_point_count_is_product_of_counts() {
    let seed = Seed::new("rec", Role::Receiver, 10.0, 20.0)
        .with_grow(3, 1.0, 0.0)
        .with_grow(4, 0.0, 1.0)
        .with_grow(5, 0.5, 0.5);
    let template = Template::new("T")
        .with_roll(6, 100.0, 0.0)
        .with_roll(7, 0.0, 100.0)
        .with_seed(seed);

    let generated: usize = RollOffsets::new(&template.roll)
        .map(|instance| GrowPoints::new(&template.seeds[0], (instance.dx, instance.dy)).count())
        .sum();
    assert_eq!(generated, 3 * 4 * 5 * 6 * 7);
    assert_eq!(template.instance_count() * template.seeds[0].point_count(), generated as u64);
}

#[test]
fn test_roll_translates_every_seed() {
    let template = Template::new("T")
        .with_roll(2, 400.0, 0.0)
        .with_seed(Seed::new("s", Role::Source, 10.0, 10.0))
        .with_seed(Seed::new("r", Role::Receiver, 0.0, 0.0).with_grow(2, 25.0, 0.0));

    let mut sources = Vec::new();
    let mut receivers = Vec::new();
    for instance in RollOffsets::new(&template.roll) {
        for seed in &template.seeds {
            for point in GrowPoints::new(seed, (instance.dx, instance.dy)) {
                match point.role {
                    Role::Source => sources.push(point.position),
                    Role::Receiver => receivers.push(point.position),
                }
            }
        }
    }
    assert_eq!(sources, vec![Coord::new(10.0, 10.0), Coord::new(410.0, 10.0)]);
    assert_eq!(
        receivers,
        vec![
            Coord::new(0.0, 0.0),
            Coord::new(25.0, 0.0),
            Coord::new(400.0, 0.0),
            Coord::new(425.0, 0.0),
        ]
    );
}
