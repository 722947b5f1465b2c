//! Routing resolver: turns a destination rank into its 3-hop path.
//!
//! Path from `src` on node A to `dst` on node B:
//!
//! ```text
//! src --(origin, local)--> rep(A,B) --(remote, network)--> rep(B,A) --(relay, local)--> dst
//! ```
//!
//! Hops collapse when `src` is its own representative, when `rep(B,A)` is
//! `dst`, or when A == B (a single origin hop). Every route is resolved once,
//! when the table is built; lookups afterwards cannot fail for in-range ranks.

use std::collections::BTreeMap;

use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::{NodeId, Rank, Topology};
use crate::Core::Transport::Link;
use crate::Shuffler::Structs::QueueClass;

/// One hop of a path: the peer it lands on and the queue class that sends it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hop {
    pub peer: Rank,
    pub class: QueueClass,
}

impl Hop {
    pub fn link(&self) -> Link {
        link_for(self.class)
    }
}

/// Where a message goes next from this process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NextHop {
    /// The message is for me.
    Deliver,
    /// Send it on through an output queue.
    Forward { peer: Rank, class: QueueClass },
}

/// Physical link used by a queue class.
pub fn link_for(class: QueueClass) -> Link {
    match class {
        QueueClass::Origin | QueueClass::Relay => Link::Local,
        QueueClass::Remote => Link::Network,
    }
}

#[derive(Copy, Clone, Debug)]
struct Route {
    node: NodeId,
    /// My node's representative for the destination node.
    src_rep: Rank,
    /// The destination node's representative for my node.
    dst_rep: Rank,
}

/// Pre-resolved routing table for one process.
#[derive(Debug)]
pub struct Router {
    me: Rank,
    my_node: NodeId,
    routes: Vec<Route>,
    local_peers: Vec<Rank>,
    /// Remote nodes whose traffic from my node goes through me, with the rank
    /// that receives it on the far side.
    represented: BTreeMap<NodeId, Rank>,
}

impl Router {
    /// Resolve every rank in the job. Any gap in the topology is a
    /// configuration error.
    pub fn build(topology: &dyn Topology) -> ShuffleResult<Self> {
        let me = topology.global_rank();
        let size = topology.global_size();
        if size == 0 || me as usize >= size {
            return Err(ShuffleError::Topology {
                message: format!("rank {me} is outside a job of {size} processes"),
            });
        }

        let my_node = topology.node_of(me).ok_or_else(|| ShuffleError::Routing {
            rank: me,
            message: "my own rank has no node".to_string(),
        })?;

        let mut routes = Vec::with_capacity(size);
        let mut local_peers = Vec::new();
        let mut represented = BTreeMap::new();
        let mut by_node: BTreeMap<NodeId, (Rank, Rank)> = BTreeMap::new();

        for dst in 0..size as Rank {
            let node = topology.node_of(dst).ok_or_else(|| ShuffleError::Routing {
                rank: dst,
                message: "rank has no node".to_string(),
            })?;

            if node == my_node {
                if dst != me {
                    local_peers.push(dst);
                }
                routes.push(Route {
                    node,
                    src_rep: me,
                    dst_rep: dst,
                });
                continue;
            }

            let (src_rep, dst_rep) = match by_node.get(&node) {
                Some(reps) => *reps,
                None => {
                    let reps = resolve_reps(topology, my_node, node, dst)?;
                    by_node.insert(node, reps);
                    if reps.0 == me {
                        represented.insert(node, reps.1);
                    }
                    reps
                }
            };
            routes.push(Route {
                node,
                src_rep,
                dst_rep,
            });
        }

        tracing::debug!(
            rank = me,
            node = my_node,
            local_peers = local_peers.len(),
            represented = represented.len(),
            "routing table built"
        );

        Ok(Self {
            me,
            my_node,
            routes,
            local_peers,
            represented,
        })
    }

    pub fn me(&self) -> Rank {
        self.me
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    pub fn global_size(&self) -> usize {
        self.routes.len()
    }

    /// Other ranks on my node.
    pub fn local_peers(&self) -> &[Rank] {
        &self.local_peers
    }

    /// Remote nodes I represent, each with its receiving representative.
    pub fn represented_nodes(&self) -> impl Iterator<Item = (NodeId, Rank)> + '_ {
        self.represented.iter().map(|(&node, &rep)| (node, rep))
    }

    fn route(&self, dst: Rank) -> ShuffleResult<&Route> {
        self.routes
            .get(dst as usize)
            .ok_or_else(|| ShuffleError::Routing {
                rank: dst,
                message: format!("outside a job of {} processes", self.routes.len()),
            })
    }

    /// Full hop list from me to `dst`. Empty when `dst` is me.
    pub fn path(&self, dst: Rank) -> ShuffleResult<Vec<Hop>> {
        let route = self.route(dst)?;
        let mut hops = Vec::with_capacity(3);
        if dst == self.me {
            return Ok(hops);
        }
        if route.node == self.my_node {
            hops.push(Hop {
                peer: dst,
                class: QueueClass::Origin,
            });
            return Ok(hops);
        }
        if route.src_rep != self.me {
            hops.push(Hop {
                peer: route.src_rep,
                class: QueueClass::Origin,
            });
        }
        hops.push(Hop {
            peer: route.dst_rep,
            class: QueueClass::Remote,
        });
        if route.dst_rep != dst {
            hops.push(Hop {
                peer: dst,
                class: QueueClass::Relay,
            });
        }
        Ok(hops)
    }

    /// The next hop for a message at this process.
    ///
    /// `from_app` selects the origin class for a same-node hop; forwarded
    /// traffic uses the relay class instead.
    pub fn next_hop(&self, dst: Rank, from_app: bool) -> ShuffleResult<NextHop> {
        let route = self.route(dst)?;
        if dst == self.me {
            return Ok(NextHop::Deliver);
        }
        if route.node == self.my_node {
            let class = if from_app {
                QueueClass::Origin
            } else {
                QueueClass::Relay
            };
            return Ok(NextHop::Forward { peer: dst, class });
        }
        if route.src_rep == self.me {
            return Ok(NextHop::Forward {
                peer: route.dst_rep,
                class: QueueClass::Remote,
            });
        }
        if from_app {
            return Ok(NextHop::Forward {
                peer: route.src_rep,
                class: QueueClass::Origin,
            });
        }
        Err(ShuffleError::Routing {
            rank: dst,
            message: format!(
                "forwarded message reached rank {} which does not represent node {}",
                self.me, route.node
            ),
        })
    }
}

fn resolve_reps(
    topology: &dyn Topology,
    my_node: NodeId,
    node: NodeId,
    dst: Rank,
) -> ShuffleResult<(Rank, Rank)> {
    let src_rep = topology
        .representative(my_node, node)
        .ok_or_else(|| ShuffleError::Routing {
            rank: dst,
            message: format!("node {my_node} has no representative for node {node}"),
        })?;
    if topology.node_of(src_rep) != Some(my_node) {
        return Err(ShuffleError::Routing {
            rank: dst,
            message: format!("representative {src_rep} is not on node {my_node}"),
        });
    }

    let dst_rep = topology
        .representative(node, my_node)
        .ok_or_else(|| ShuffleError::Routing {
            rank: dst,
            message: format!("node {node} has no representative for node {my_node}"),
        })?;
    if topology.node_of(dst_rep) != Some(node) {
        return Err(ShuffleError::Routing {
            rank: dst,
            message: format!("representative {dst_rep} is not on node {node}"),
        });
    }
    Ok((src_rep, dst_rep))
}
