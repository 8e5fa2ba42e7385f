use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{Coord, Direction, GameState, PeerId, Snake};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of one simulation step.
#[derive(Debug, Clone)]
pub struct Advance {
    pub state: GameState,
    /// Players whose snake died this step.
    pub eliminated: Vec<PeerId>,
}

/// The game rules the master runs each tick. The state order is left alone;
/// the caller owns it.
pub trait Simulation: Send + Sync {
    /// Places a fresh snake for `player`. Returns false when the field has no
    /// room for one.
    fn spawn(&self, state: &mut GameState, player: PeerId) -> bool;

    fn advance(&self, state: &GameState, inputs: &HashMap<PeerId, Direction>) -> Advance;

    /// Detaches `player` from its snake, which keeps moving on its own.
    fn retire(&self, state: &mut GameState, player: PeerId) {
        if let Some(snake) = state.snakes.get_mut(&player) {
            snake.zombie = true;
            debug!("Snake of player {} is now a zombie", player);
        }
    }
}

/// Classic snake on a wrapping grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnakeRules;

/// Half the side of the empty square a new snake needs around its head.
const SPAWN_MARGIN: i32 = 2;

impl SnakeRules {
    pub fn new() -> Self {
        Self
    }

    fn occupied(state: &GameState) -> HashSet<Coord> {
        state
            .snakes
            .values()
            .flat_map(|snake| snake.body.iter().copied())
            .collect()
    }

    fn square_is_free(center: Coord, occupied: &HashSet<Coord>, width: i32, height: i32) -> bool {
        (-SPAWN_MARGIN..=SPAWN_MARGIN).all(|dx| {
            (-SPAWN_MARGIN..=SPAWN_MARGIN).all(|dy| {
                let cell = Coord::new(
                    (center.x + dx).rem_euclid(width),
                    (center.y + dy).rem_euclid(height),
                );
                !occupied.contains(&cell)
            })
        })
    }

    fn top_up_food<R: Rng>(state: &mut GameState, rng: &mut R) {
        let alive = state.snakes.values().filter(|snake| !snake.zombie).count();
        let target = state.config.food_static as usize
            + (state.config.food_per_player * alive as f32) as usize;
        if state.food.len() >= target {
            return;
        }

        let occupied = Self::occupied(state);
        let mut free: Vec<Coord> = (0..state.config.width)
            .flat_map(|x| (0..state.config.height).map(move |y| Coord::new(x, y)))
            .filter(|cell| !occupied.contains(cell) && !state.food.contains(cell))
            .collect();

        while state.food.len() < target && !free.is_empty() {
            let index = rng.gen_range(0..free.len());
            state.food.push(free.swap_remove(index));
        }
    }
}

impl Simulation for SnakeRules {
    fn spawn(&self, state: &mut GameState, player: PeerId) -> bool {
        let (width, height) = (state.config.width, state.config.height);
        let occupied = Self::occupied(state);
        let mut rng = rand::thread_rng();

        let mut centers: Vec<Coord> = (0..width)
            .flat_map(|x| (0..height).map(move |y| Coord::new(x, y)))
            .collect();
        centers.shuffle(&mut rng);

        for head in centers {
            if state.food.contains(&head) || !Self::square_is_free(head, &occupied, width, height) {
                continue;
            }

            let mut directions = Direction::ALL;
            directions.shuffle(&mut rng);
            for tail_side in directions {
                let tail = head.step(tail_side, width, height);
                if state.food.contains(&tail) {
                    continue;
                }
                state
                    .snakes
                    .insert(player, Snake::new(vec![head, tail], tail_side.opposite()));
                info!("Spawned snake for player {} at ({}, {})", player, head.x, head.y);
                return true;
            }
        }

        false
    }

    fn advance(&self, current: &GameState, inputs: &HashMap<PeerId, Direction>) -> Advance {
        let mut next = current.clone();
        let (width, height) = (next.config.width, next.config.height);
        let mut rng = rand::thread_rng();

        for (id, direction) in inputs {
            if let Some(snake) = next.snakes.get_mut(id) {
                if !snake.zombie {
                    snake.steer(*direction);
                }
            }
        }

        for (id, snake) in next.snakes.iter_mut() {
            let Some(head) = snake.head() else {
                continue;
            };
            let new_head = head.step(snake.direction, width, height);
            snake.body.insert(0, new_head);

            match next.food.iter().position(|food| *food == new_head) {
                Some(index) => {
                    next.food.swap_remove(index);
                    if let Some(player) = next.players.get_mut(id) {
                        player.score += 1;
                    }
                }
                None => {
                    snake.body.pop();
                }
            }
        }

        let mut owners: HashMap<Coord, Vec<PeerId>> = HashMap::new();
        for (id, snake) in &next.snakes {
            for cell in &snake.body {
                owners.entry(*cell).or_default().push(*id);
            }
        }

        // A head sharing its cell with any other body cell dies, its own included.
        let mut dead = BTreeSet::new();
        let mut kills = Vec::new();
        for (id, snake) in &next.snakes {
            let Some(head) = snake.head() else {
                continue;
            };
            let Some(cell_owners) = owners.get(&head) else {
                continue;
            };
            if cell_owners.len() > 1 {
                dead.insert(*id);
                kills.extend(cell_owners.iter().filter(|owner| *owner != id).copied());
            }
        }

        for killer in kills {
            if let Some(player) = next.players.get_mut(&killer) {
                player.score += 1;
            }
        }

        let mut eliminated = Vec::new();
        for id in &dead {
            let Some(snake) = next.snakes.remove(id) else {
                continue;
            };
            for cell in snake.body {
                if rng.gen::<f32>() < next.config.dead_food_prob && !next.food.contains(&cell) {
                    next.food.push(cell);
                }
            }
            if next.players.contains_key(id) && !snake.zombie {
                eliminated.push(*id);
            }
        }

        // Corpse food never lands under a surviving snake.
        let occupied = Self::occupied(&next);
        next.food.retain(|cell| !occupied.contains(cell));

        Self::top_up_food(&mut next, &mut rng);

        Advance {
            state: next,
            eliminated,
        }
    }
}
